//! Per-modality feature encoders.
//!
//! Each encoder is a small Conv1d stack followed by a shared tail:
//!
//! ```text
//! [B, C, T] → conv stack → [B, d, T] → transpose → [B, T, d]
//!   → + sinusoids (→ per-head RoPE when enabled)
//!   → dropout → RMSNorm
//!   → (+ cross-attention over an auxiliary sequence)
//!   → dropout → RMSNorm
//! ```
//!
//! - [`SpectrogramEncoder`]: mel spectrograms and envelope-like features
//! - [`WaveformEncoder`]: raw samples, strided down by 16
//! - [`PitchEncoder`]: F0/pitch/phase tracks; RoPE frequencies follow the
//!   F0 values when they are available

use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, RmsNorm, VarBuilder};

use super::activation::Activation;
use super::attention::{MultiHeadAttention, merge_heads, split_heads};
use super::positional::sinusoids;
use super::rope::RotaryEmbedding;
use crate::config::{EchoConfig, check_heads};
use crate::features::{FeatureKind, adaptive_avg_pool1d};
use crate::{Error, Result};

const ROPE_THETA: f64 = 10000.0;
const RMS_EPS: f64 = 1e-6;

/// Construction parameters shared by all feature encoders.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderOptions {
    pub dims: usize,
    pub head: usize,
    pub activation: Activation,
    pub use_rope: bool,
    pub max_tscale: f64,
    pub dropout: f32,
    /// Add a cross-attention residual over an auxiliary sequence.
    pub attend_aux: bool,
    /// Waveform encoder output length.
    pub target_length: Option<usize>,
}

impl EncoderOptions {
    pub fn from_config(config: &EchoConfig) -> Self {
        Self {
            dims: config.dims,
            head: config.head,
            activation: Activation::from_name(&config.activation),
            use_rope: config.use_rope,
            max_tscale: config.max_tscale,
            dropout: config.encoder_dropout,
            attend_aux: false,
            target_length: config.target_length,
        }
    }
}

fn conv(
    vb: VarBuilder,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    groups: usize,
) -> Result<Conv1d> {
    let cfg = Conv1dConfig {
        padding,
        stride,
        dilation: 1,
        groups,
        ..Default::default()
    };
    Ok(candle_nn::conv1d(in_channels, out_channels, kernel_size, cfg, vb)?)
}

/// Conv1d layers, each followed by the activation.
#[derive(Debug, Clone)]
struct ConvStack {
    convs: Vec<Conv1d>,
    activation: Activation,
}

impl ConvStack {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for conv in &self.convs {
            x = self.activation.forward(&conv.forward(&x)?)?;
        }
        Ok(x)
    }
}

/// Positions, normalization and the optional auxiliary attention.
#[derive(Debug, Clone)]
struct EncoderTail {
    head: usize,
    use_rope: bool,
    max_tscale: f64,
    dropout: f32,
    rope: RotaryEmbedding,
    norm: RmsNorm,
    aux: Option<MultiHeadAttention>,
}

impl EncoderTail {
    fn load(vb: VarBuilder, opts: &EncoderOptions, rope: RotaryEmbedding) -> Result<Self> {
        let aux = if opts.attend_aux {
            Some(MultiHeadAttention::load(vb.pp("aux_attn"), opts.dims, opts.head)?)
        } else {
            None
        };
        Ok(Self {
            head: opts.head,
            use_rope: opts.use_rope,
            max_tscale: opts.max_tscale,
            dropout: opts.dropout,
            rope,
            norm: candle_nn::rms_norm(opts.dims, RMS_EPS, vb.pp("norm"))?,
            aux,
        })
    }

    fn dropout(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if train && self.dropout > 0.0 {
            Ok(candle_nn::ops::dropout(x, self.dropout)?)
        } else {
            Ok(x.clone())
        }
    }

    /// `x`: `[B, T, d]`; `f0`: `[B, T]` or `[T]` rotary pitch offsets.
    fn forward(&self, x: &Tensor, f0: Option<&Tensor>, xa: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let (_, ctx, dims) = x.dims3()?;
        let positions = sinusoids(ctx, dims, self.max_tscale, x.device())?.to_dtype(x.dtype())?;
        let mut x = x.broadcast_add(&positions)?;

        if self.use_rope {
            let (cos, sin) = match f0 {
                Some(f0) if f0.dim(candle_core::D::Minus1)? == ctx => {
                    self.rope.compute_freqs_with_f0(f0, x.dtype())?
                }
                Some(f0) => {
                    return Err(Error::UnsupportedShape(format!(
                        "f0 track {:?} does not match {ctx} encoded frames",
                        f0.dims()
                    )));
                }
                None => self.rope.compute_freqs(ctx, x.dtype(), x.device())?,
            };
            let heads = split_heads(&x, self.head)?;
            x = merge_heads(&RotaryEmbedding::apply(&heads, &cos, &sin)?)?;
        }

        let x = self.norm.forward(&self.dropout(&x, train)?)?;
        let x = match (&self.aux, xa) {
            (Some(attn), Some(xa)) => (&x + attn.forward(&x, Some(xa), None, false)?)?,
            _ => x,
        };
        Ok(self.norm.forward(&self.dropout(&x, train)?)?)
    }
}

/// `[C, T]` → `[1, C, T]`; rank 3 passes through.
fn spectrogram_input(x: &Tensor) -> Result<Tensor> {
    match x.rank() {
        2 => Ok(x.unsqueeze(0)?),
        3 => Ok(x.clone()),
        _ => Err(Error::shape("spectrogram encoder input", x.dims())),
    }
}

/// `[T]` → `[1, 1, T]`, `[B, T]` → `[B, 1, T]`; rank 3 passes through.
fn track_input(x: &Tensor) -> Result<Tensor> {
    match x.rank() {
        1 => Ok(x.unsqueeze(0)?.unsqueeze(0)?),
        2 => Ok(x.unsqueeze(1)?),
        3 => Ok(x.clone()),
        _ => Err(Error::shape("single-channel encoder input", x.dims())),
    }
}

#[derive(Debug, Clone)]
pub struct SpectrogramEncoder {
    stack: ConvStack,
    tail: EncoderTail,
}

impl SpectrogramEncoder {
    pub fn load(vb: VarBuilder, mels: usize, opts: &EncoderOptions) -> Result<Self> {
        check_heads(opts.dims, opts.head)?;
        let d = opts.dims;
        let convs = vec![
            conv(vb.pp("convs.0"), mels, d, 3, 1, 1, 1)?,
            conv(vb.pp("convs.1"), d, d, 3, 1, 1, 1)?,
            conv(vb.pp("convs.2"), d, d, 3, 1, 1, d)?,
        ];
        Ok(Self {
            stack: ConvStack {
                convs,
                activation: opts.activation,
            },
            tail: EncoderTail::load(vb, opts, RotaryEmbedding::new(d / opts.head, ROPE_THETA))?,
        })
    }

    /// `x`: `[B, mels, T]` or `[mels, T]` → `[B, T, dims]`.
    pub fn forward(&self, x: &Tensor, xa: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let x = self.stack.forward(&spectrogram_input(x)?)?.transpose(1, 2)?;
        self.tail.forward(&x, None, xa, train)
    }
}

#[derive(Debug, Clone)]
pub struct WaveformEncoder {
    stack: ConvStack,
    tail: EncoderTail,
    target_length: Option<usize>,
}

impl WaveformEncoder {
    pub fn load(vb: VarBuilder, opts: &EncoderOptions) -> Result<Self> {
        check_heads(opts.dims, opts.head)?;
        let d = opts.dims;
        if d % 4 != 0 {
            return Err(Error::Config(format!(
                "waveform encoder needs dims divisible by 4, got {d}"
            )));
        }
        let convs = vec![
            conv(vb.pp("convs.0"), 1, d / 4, 15, 4, 7, 1)?,
            conv(vb.pp("convs.1"), d / 4, d / 2, 7, 2, 3, 1)?,
            conv(vb.pp("convs.2"), d / 2, d, 5, 2, 2, 1)?,
        ];
        Ok(Self {
            stack: ConvStack {
                convs,
                activation: opts.activation,
            },
            tail: EncoderTail::load(vb, opts, RotaryEmbedding::new(d / opts.head, ROPE_THETA))?,
            target_length: opts.target_length,
        })
    }

    /// `x`: `[B, 1, N]`, `[B, N]` or `[N]` → `[B, T, dims]` with
    /// `T = target_length` when set, else about `N / 16`.
    pub fn forward(&self, x: &Tensor, xa: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let x = self.stack.forward(&track_input(x)?)?;
        let x = match self.target_length {
            Some(target) if x.dim(2)? != target => adaptive_avg_pool1d(&x, target)?,
            _ => x,
        };
        self.tail.forward(&x.transpose(1, 2)?, None, xa, train)
    }
}

#[derive(Debug, Clone)]
pub struct PitchEncoder {
    stack: ConvStack,
    tail: EncoderTail,
    /// Feed the input track to the rotary frequencies.
    pitch_rope: bool,
}

impl PitchEncoder {
    pub fn load(vb: VarBuilder, opts: &EncoderOptions, pitch_rope: bool) -> Result<Self> {
        check_heads(opts.dims, opts.head)?;
        let d = opts.dims;
        let convs = vec![
            conv(vb.pp("convs.0"), 1, d, 7, 1, 3, 1)?,
            conv(vb.pp("convs.1"), d, d, 5, 1, 2, 1)?,
            conv(vb.pp("convs.2"), d, d, 3, 1, 1, d)?,
        ];
        Ok(Self {
            stack: ConvStack {
                convs,
                activation: opts.activation,
            },
            tail: EncoderTail::load(vb, opts, RotaryEmbedding::mel(d / opts.head, ROPE_THETA))?,
            pitch_rope,
        })
    }

    /// `x`: `[B, 1, T]`, `[B, T]` or `[T]` → `[B, T, dims]`.
    pub fn forward(&self, x: &Tensor, xa: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let x = track_input(x)?;
        // The convolutions keep the length, so the track lines up with the output.
        let f0 = if self.pitch_rope {
            Some(x.squeeze(1)?)
        } else {
            None
        };
        let encoded = self.stack.forward(&x)?.transpose(1, 2)?;
        self.tail.forward(&encoded, f0.as_ref(), xa, train)
    }
}

/// An encoder selected by feature kind.
#[derive(Debug, Clone)]
pub enum FeatureEncoder {
    Spectrogram(SpectrogramEncoder),
    Waveform(WaveformEncoder),
    Pitch(PitchEncoder),
}

impl FeatureEncoder {
    /// `x` → `[B, T, dims]`; `xa` is an optional `[B, S_aux, dims]`
    /// auxiliary sequence for encoders built with `attend_aux`.
    pub fn forward(&self, x: &Tensor, xa: Option<&Tensor>, train: bool) -> Result<Tensor> {
        match self {
            FeatureEncoder::Spectrogram(encoder) => encoder.forward(x, xa, train),
            FeatureEncoder::Waveform(encoder) => encoder.forward(x, xa, train),
            FeatureEncoder::Pitch(encoder) => encoder.forward(x, xa, train),
        }
    }
}

/// Build the encoder for `kind`.
///
/// Spectrogram, harmonics and aperiodics share the spectrogram stack over
/// `mels` channels; pitch, f0 and phase use the pitch stack (only pitch and
/// f0 condition RoPE on the track). Token-aligned F0 has no encoder.
pub fn build_feature_encoder(
    vb: VarBuilder,
    kind: FeatureKind,
    mels: usize,
    opts: &EncoderOptions,
) -> Result<FeatureEncoder> {
    tracing::debug!(%kind, dims = opts.dims, use_rope = opts.use_rope, "building feature encoder");
    match kind {
        FeatureKind::Spectrogram | FeatureKind::Harmonics | FeatureKind::Aperiodics => {
            Ok(FeatureEncoder::Spectrogram(SpectrogramEncoder::load(vb, mels, opts)?))
        }
        FeatureKind::Waveform => Ok(FeatureEncoder::Waveform(WaveformEncoder::load(vb, opts)?)),
        FeatureKind::Pitch | FeatureKind::F0 => {
            Ok(FeatureEncoder::Pitch(PitchEncoder::load(vb, opts, true)?))
        }
        FeatureKind::Phase => Ok(FeatureEncoder::Pitch(PitchEncoder::load(vb, opts, false)?)),
        FeatureKind::F0t => Err(Error::UnknownFeature(format!(
            "no encoder for feature '{kind}'"
        ))),
    }
}

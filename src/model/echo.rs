//! The echo encoder/decoder.
//!
//! ```text
//! feature [B, C, T] → FeatureEncoder → N × EncoderBlock → RMSNorm → audio states
//! ids [B, S] → embedding + learned positions
//!           → M × DecoderBlock (causal self-attn, cross-attn, MLP)
//!           → RMSNorm → tied projection → logits [B, S, vocab]
//! ```
//!
//! Encoder blocks use iterative refinement attention, windowed when the
//! config asks for it. Generation keeps one [`KvCache`] per decoder block.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Embedding, RmsNorm, VarBuilder};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::attention::{IterativeAttention, MultiHeadAttention, SlidingWindowAttention};
use super::encoder::{EncoderOptions, FeatureEncoder, build_feature_encoder};
use super::kv_cache::KvCache;
use super::positional::LearnedSinusoids;
use crate::config::{EchoConfig, GenerationConfig};
use crate::{Error, Result};

const RMS_EPS: f64 = 1e-6;

/// A model that maps token ids plus an audio feature tensor to logits.
pub trait SpeechSeq2Seq {
    /// `input_ids`: `[B, S]` → logits `[B, S, vocab]`.
    fn logits(&self, input_ids: &Tensor, features: &Tensor, train: bool) -> Result<Tensor>;

    /// Continue `input_ids` until EOS or the length cap, `[B, L]` `u32`.
    fn generate(&self, input_ids: &Tensor, features: &Tensor, config: &GenerationConfig) -> Result<Tensor>;

    fn config(&self) -> &EchoConfig;
}

fn dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        Ok(candle_nn::ops::dropout(x, p)?)
    } else {
        Ok(x.clone())
    }
}

/// `Linear(d, 4d) → GELU → Linear(4d, d)`.
#[derive(Debug, Clone)]
struct Mlp {
    fc1: candle_nn::Linear,
    fc2: candle_nn::Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, dims: usize) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(dims, dims * 4, vb.pp("fc1"))?,
            fc2: candle_nn::linear(dims * 4, dims, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.fc2.forward(&self.fc1.forward(x)?.gelu_erf()?)?)
    }
}

#[derive(Debug, Clone)]
enum EncoderAttention {
    Full(IterativeAttention),
    Windowed(SlidingWindowAttention),
}

impl EncoderAttention {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            EncoderAttention::Full(attn) => attn.forward(x, None, None),
            EncoderAttention::Windowed(attn) => attn.forward(x, None),
        }
    }
}

#[derive(Debug, Clone)]
struct EncoderBlock {
    attn_norm: RmsNorm,
    attn: EncoderAttention,
    mlp_norm: RmsNorm,
    mlp: Mlp,
    dropout: f32,
}

impl EncoderBlock {
    fn load(vb: VarBuilder, config: &EchoConfig) -> Result<Self> {
        let dims = config.dims;
        let attn = match config.attention.sliding_window {
            Some(window) => EncoderAttention::Windowed(SlidingWindowAttention::load(
                vb.pp("attn"),
                dims,
                config.head,
                &config.attention,
                window,
            )?),
            None => EncoderAttention::Full(IterativeAttention::load(
                vb.pp("attn"),
                dims,
                config.head,
                &config.attention,
            )?),
        };
        Ok(Self {
            attn_norm: candle_nn::rms_norm(dims, RMS_EPS, vb.pp("attn_norm"))?,
            attn,
            mlp_norm: candle_nn::rms_norm(dims, RMS_EPS, vb.pp("mlp_norm"))?,
            mlp: Mlp::load(vb.pp("mlp"), dims)?,
            dropout: config.attention.dropout,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.attn.forward(&self.attn_norm.forward(x)?)?;
        let x = (x + dropout(&h, self.dropout, train)?)?;
        let h = self.mlp.forward(&self.mlp_norm.forward(&x)?)?;
        Ok((&x + dropout(&h, self.dropout, train)?)?)
    }
}

#[derive(Debug, Clone)]
struct DecoderBlock {
    self_norm: RmsNorm,
    self_attn: MultiHeadAttention,
    cross_norm: RmsNorm,
    cross_attn: MultiHeadAttention,
    mlp_norm: RmsNorm,
    mlp: Mlp,
    dropout: f32,
}

impl DecoderBlock {
    fn load(vb: VarBuilder, config: &EchoConfig) -> Result<Self> {
        let dims = config.dims;
        Ok(Self {
            self_norm: candle_nn::rms_norm(dims, RMS_EPS, vb.pp("self_norm"))?,
            self_attn: MultiHeadAttention::load(vb.pp("self_attn"), dims, config.head)?,
            cross_norm: candle_nn::rms_norm(dims, RMS_EPS, vb.pp("cross_norm"))?,
            cross_attn: MultiHeadAttention::load(vb.pp("cross_attn"), dims, config.head)?,
            mlp_norm: candle_nn::rms_norm(dims, RMS_EPS, vb.pp("mlp_norm"))?,
            mlp: Mlp::load(vb.pp("mlp"), dims)?,
            dropout: config.attention.dropout,
        })
    }

    /// Full causal pass, or an incremental one when `cache` is given.
    fn forward(
        &self,
        x: &Tensor,
        audio: &Tensor,
        cache: Option<(&mut KvCache, usize)>,
        train: bool,
    ) -> Result<Tensor> {
        let normed = self.self_norm.forward(x)?;
        let h = match cache {
            Some((cache, start_pos)) => self.self_attn.forward_cached(&normed, cache, start_pos)?,
            None => self.self_attn.forward(&normed, None, None, true)?,
        };
        let x = (x + dropout(&h, self.dropout, train)?)?;
        let h = self
            .cross_attn
            .forward(&self.cross_norm.forward(&x)?, Some(audio), None, false)?;
        let x = (&x + dropout(&h, self.dropout, train)?)?;
        let h = self.mlp.forward(&self.mlp_norm.forward(&x)?)?;
        Ok((&x + dropout(&h, self.dropout, train)?)?)
    }
}

#[derive(Debug, Clone)]
pub struct EchoModel {
    encoder: FeatureEncoder,
    encoder_blocks: Vec<EncoderBlock>,
    encoder_norm: RmsNorm,
    token_embedding: Embedding,
    positions: LearnedSinusoids,
    decoder_blocks: Vec<DecoderBlock>,
    decoder_norm: RmsNorm,
    config: EchoConfig,
}

impl EchoModel {
    pub fn load(vb: VarBuilder, config: &EchoConfig) -> Result<Self> {
        config.validate()?;
        let dims = config.dims;

        let encoder = build_feature_encoder(
            vb.pp("encoder.features"),
            config.feature,
            config.mels,
            &EncoderOptions::from_config(config),
        )?;
        let encoder_blocks = (0..config.encoder_layers)
            .map(|i| EncoderBlock::load(vb.pp(format!("encoder.blocks.{i}")), config))
            .collect::<Result<Vec<_>>>()?;

        let token_embedding = candle_nn::embedding(config.vocab_size, dims, vb.pp("decoder.token_embedding"))?;
        let positions = LearnedSinusoids::load(
            vb.pp("decoder.positions"),
            config.text_ctx,
            dims,
            config.max_tscale,
        )?;
        let decoder_blocks = (0..config.decoder_layers)
            .map(|i| DecoderBlock::load(vb.pp(format!("decoder.blocks.{i}")), config))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            feature = %config.feature,
            dims,
            encoder_layers = config.encoder_layers,
            decoder_layers = config.decoder_layers,
            windowed = config.attention.sliding_window.is_some(),
            "loaded echo model"
        );

        Ok(Self {
            encoder,
            encoder_blocks,
            encoder_norm: candle_nn::rms_norm(dims, RMS_EPS, vb.pp("encoder.norm"))?,
            token_embedding,
            positions,
            decoder_blocks,
            decoder_norm: candle_nn::rms_norm(dims, RMS_EPS, vb.pp("decoder.norm"))?,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &EchoConfig {
        &self.config
    }

    fn dtype(&self) -> DType {
        self.token_embedding.embeddings().dtype()
    }

    /// Audio states `[B, T, dims]` for a feature tensor.
    pub fn encode(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let features = features.to_dtype(self.dtype())?;
        let mut x = self.encoder.forward(&features, None, train)?;
        for block in &self.encoder_blocks {
            x = block.forward(&x, train)?;
        }
        Ok(self.encoder_norm.forward(&x)?)
    }

    fn embed(&self, input_ids: &Tensor, start_pos: usize) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let tokens = self.token_embedding.forward(&input_ids.to_dtype(DType::U32)?)?;
        let positions = self.positions.range(start_pos, seq_len)?;
        Ok(tokens.broadcast_add(&positions)?)
    }

    fn project(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.decoder_norm.forward(x)?;
        Ok(x.broadcast_matmul(&self.token_embedding.embeddings().t()?)?)
    }

    /// Logits `[B, S, vocab]` for a full decoder pass over `input_ids`.
    pub fn decode(&self, input_ids: &Tensor, audio: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = self.embed(input_ids, 0)?;
        for block in &self.decoder_blocks {
            x = block.forward(&x, audio, None, train)?;
        }
        self.project(&x)
    }

    pub fn forward(&self, input_ids: &Tensor, features: &Tensor, train: bool) -> Result<Tensor> {
        let audio = self.encode(features, train)?;
        if audio.dim(0)? != input_ids.dim(0)? {
            return Err(Error::UnsupportedShape(format!(
                "ids {:?} and features {:?} disagree on batch",
                input_ids.dims(),
                features.dims()
            )));
        }
        self.decode(input_ids, &audio, train)
    }

    fn decode_step(
        &self,
        input_ids: &Tensor,
        audio: &Tensor,
        caches: &mut [KvCache],
        start_pos: usize,
    ) -> Result<Tensor> {
        let mut x = self.embed(input_ids, start_pos)?;
        for (block, cache) in self.decoder_blocks.iter().zip(caches.iter_mut()) {
            x = block.forward(&x, audio, Some((cache, start_pos)), false)?;
        }
        self.project(&x)
    }

    /// Greedy or top-k continuation of `input_ids` (`[B, P]`, usually just
    /// the BOS column).
    ///
    /// Stops after `max_length` tokens (capped at `text_ctx`) or once every
    /// row has produced EOS. Rows that finished early are filled with
    /// `pad_token_id`. The prompt is included in the result.
    pub fn generate(&self, input_ids: &Tensor, features: &Tensor, generation: &GenerationConfig) -> Result<Tensor> {
        let (batch, prompt_len) = input_ids.dims2()?;
        if prompt_len == 0 {
            return Err(Error::shape("generate prompt", input_ids.dims()));
        }
        let input_ids = input_ids.to_dtype(DType::U32)?;
        let max_length = generation.max_length.min(self.config.text_ctx);
        if prompt_len >= max_length {
            return Ok(input_ids);
        }

        let audio = self.encode(features, false)?;
        if audio.dim(0)? != batch {
            return Err(Error::UnsupportedShape(format!(
                "ids {:?} and features {:?} disagree on batch",
                input_ids.dims(),
                features.dims()
            )));
        }
        let device = audio.device().clone();
        let mut caches = (0..self.decoder_blocks.len())
            .map(|_| {
                KvCache::new(
                    batch,
                    max_length,
                    self.config.head,
                    self.config.head_dim(),
                    audio.dtype(),
                    &device,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut rng = ChaCha8Rng::seed_from_u64(generation.seed);
        let mut rows: Vec<Vec<u32>> = input_ids.to_vec2()?;
        let mut finished = vec![false; batch];
        let mut step_input = input_ids;
        let mut start_pos = 0;
        let mut len = prompt_len;

        while len < max_length {
            let seq_len = step_input.dim(1)?;
            let logits = self.decode_step(&step_input, &audio, &mut caches, start_pos)?;
            let last: Vec<Vec<f32>> = logits
                .narrow(1, seq_len - 1, 1)?
                .squeeze(1)?
                .to_dtype(DType::F32)?
                .to_vec2()?;
            start_pos += seq_len;

            let mut next = Vec::with_capacity(batch);
            for (row, row_logits) in last.iter().enumerate() {
                let token = if finished[row] {
                    generation.pad_token_id
                } else if generation.do_sample {
                    sample_top_k(row_logits, generation.top_k, generation.temperature, &mut rng)
                } else {
                    argmax(row_logits)
                };
                if !finished[row] && token == generation.eos_token_id {
                    finished[row] = true;
                }
                rows[row].push(token);
                next.push(token);
            }
            len += 1;
            if finished.iter().all(|&done| done) {
                break;
            }
            step_input = Tensor::from_vec(next, (batch, 1), &device)?;
        }

        tracing::debug!(batch, len, sampled = generation.do_sample, "generation finished");
        Ok(Tensor::from_vec(rows.concat(), (batch, len), &device)?)
    }
}

impl SpeechSeq2Seq for EchoModel {
    fn logits(&self, input_ids: &Tensor, features: &Tensor, train: bool) -> Result<Tensor> {
        self.forward(input_ids, features, train)
    }

    fn generate(&self, input_ids: &Tensor, features: &Tensor, config: &GenerationConfig) -> Result<Tensor> {
        EchoModel::generate(self, input_ids, features, config)
    }

    fn config(&self) -> &EchoConfig {
        &self.config
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

/// Sample among the `top_k` highest logits after temperature scaling.
///
/// Walks the CDF of the renormalized weights with one uniform draw.
fn sample_top_k(logits: &[f32], top_k: usize, temperature: f64, rng: &mut impl Rng) -> u32 {
    let mut ranked: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(top_k.max(1));
    let Some(&(_, best)) = ranked.first() else {
        return 0;
    };

    let temperature = if temperature > 0.0 { temperature } else { 1.0 };
    let weights: Vec<f64> = ranked
        .iter()
        .map(|&(_, logit)| ((logit as f64 - best as f64) / temperature).exp())
        .collect();
    let total: f64 = weights.iter().sum();

    let sample = rng.random::<f64>() * total;
    let mut cumulative = 0.0f64;
    for (&(index, _), weight) in ranked.iter().zip(&weights) {
        cumulative += weight;
        if sample < cumulative {
            return index as u32;
        }
    }
    ranked.last().map(|&(index, _)| index as u32).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlidingWindow;
    use crate::features::FeatureKind;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tiny_config() -> EchoConfig {
        EchoConfig {
            vocab_size: 12,
            text_ctx: 8,
            mels: 4,
            dims: 16,
            head: 2,
            encoder_layers: 1,
            decoder_layers: 2,
            ..EchoConfig::default()
        }
    }

    fn load(config: &EchoConfig) -> (VarMap, EchoModel) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = EchoModel::load(vb, config).unwrap();
        (varmap, model)
    }

    fn spectrogram(batch: usize) -> Tensor {
        Tensor::randn(0f32, 1.0, (batch, 4, 12), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_logits_shape() {
        let (_varmap, model) = load(&tiny_config());
        let ids = Tensor::new(&[[1u32, 5, 6], [1, 7, 0]], &Device::Cpu).unwrap();
        let logits = model.forward(&ids, &spectrogram(2), false).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 12]);
    }

    #[test]
    fn test_windowed_encoder_and_waveform_feature() {
        let mut config = tiny_config();
        config.feature = FeatureKind::Waveform;
        config.attention.sliding_window = Some(SlidingWindow {
            win_size: 4,
            span_len: 8,
        });
        let (_varmap, model) = load(&config);
        let wave = Tensor::randn(0f32, 1.0, (1, 1, 320), &Device::Cpu).unwrap();
        let audio = model.encode(&wave, false).unwrap();
        assert_eq!(audio.dims(), &[1, 20, 16]);
        let ids = Tensor::new(&[[1u32, 3]], &Device::Cpu).unwrap();
        assert_eq!(model.forward(&ids, &wave, false).unwrap().dims(), &[1, 2, 12]);
    }

    #[test]
    fn test_batch_mismatch_rejected() {
        let (_varmap, model) = load(&tiny_config());
        let ids = Tensor::new(&[[1u32, 5]], &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&ids, &spectrogram(2), false),
            Err(Error::UnsupportedShape(_))
        ));
    }

    #[test]
    fn test_greedy_generation_matches_full_decoding() {
        let (_varmap, model) = load(&tiny_config());
        let features = spectrogram(2);
        let generation = GenerationConfig {
            max_length: 6,
            eos_token_id: 99,
            ..model.config().generation_config()
        };
        let bos = Tensor::new(&[[1u32], [1]], &Device::Cpu).unwrap();
        let generated: Vec<Vec<u32>> = model.generate(&bos, &features, &generation).unwrap().to_vec2().unwrap();
        assert!(generated.iter().all(|row| row.len() == 6));

        // Re-run the batch without the cache, one argmax per row at a time.
        let mut expected = vec![vec![1u32]; 2];
        while expected[0].len() < 6 {
            let ids = Tensor::from_vec(expected.concat(), (2, expected[0].len()), &Device::Cpu).unwrap();
            let logits = model.forward(&ids, &features, false).unwrap();
            let step = expected[0].len() - 1;
            for (row, ids) in expected.iter_mut().enumerate() {
                let last: Vec<f32> = logits.get(row).unwrap().get(step).unwrap().to_vec1().unwrap();
                ids.push(argmax(&last));
            }
        }
        assert_eq!(generated, expected);
    }

    #[test]
    fn test_finished_rows_are_padded() {
        let (_varmap, model) = load(&tiny_config());
        let features = spectrogram(2);
        let bos = Tensor::new(&[[1u32], [1]], &Device::Cpu).unwrap();
        let first_step = GenerationConfig {
            max_length: 2,
            eos_token_id: 99,
            ..GenerationConfig::default()
        };
        // Whatever row 0 emits first becomes EOS.
        let first = model.generate(&bos, &features, &first_step).unwrap();
        let first: Vec<Vec<u32>> = first.to_vec2().unwrap();
        let eos = first[0][1];

        let generation = GenerationConfig {
            max_length: 5,
            eos_token_id: eos,
            pad_token_id: 0,
            ..GenerationConfig::default()
        };
        let out: Vec<Vec<u32>> = model.generate(&bos, &features, &generation).unwrap().to_vec2().unwrap();
        assert_eq!(out[0][1], eos);
        assert!(out[0][2..].iter().all(|&t| t == 0));
        if eos != 0 {
            let eos_count = out[1].iter().filter(|&&t| t == eos).count();
            assert!(eos_count <= 1);
        }
    }

    #[test]
    fn test_sampling_is_seeded() {
        let (_varmap, model) = load(&tiny_config());
        let features = spectrogram(1);
        let bos = Tensor::new(&[[1u32]], &Device::Cpu).unwrap();
        let generation = GenerationConfig {
            max_length: 6,
            seed: 7,
            ..GenerationConfig::default()
        }
        .sampling(5);
        let a: Vec<Vec<u32>> = model.generate(&bos, &features, &generation).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<u32>> = model.generate(&bos, &features, &generation).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
        assert!(a[0].len() <= 6);
    }

    #[test]
    fn test_top_k_one_is_argmax() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let logits = [0.1f32, 2.0, -1.0, 1.5];
        for _ in 0..10 {
            assert_eq!(sample_top_k(&logits, 1, 1.0, &mut rng), 1);
        }
        for _ in 0..50 {
            let token = sample_top_k(&logits, 2, 0.7, &mut rng);
            assert!(token == 1 || token == 3);
        }
    }

    #[test]
    fn test_prompt_at_cap_is_returned() {
        let (_varmap, model) = load(&tiny_config());
        let ids = Tensor::new(&[[1u32, 4, 4]], &Device::Cpu).unwrap();
        let generation = GenerationConfig {
            max_length: 3,
            ..GenerationConfig::default()
        };
        let out: Vec<Vec<u32>> = model.generate(&ids, &spectrogram(1), &generation).unwrap().to_vec2().unwrap();
        assert_eq!(out, vec![vec![1, 4, 4]]);
    }
}

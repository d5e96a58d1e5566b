//! Per-utterance feature extraction into tensors.
//!
//! [`FeatureExtractor`] runs the DSP in [`crate::audio`] over one waveform
//! and packs the results as CPU `f32` tensors:
//!
//! | kind         | shape              |
//! |--------------|--------------------|
//! | `waveform`   | `[samples]`        |
//! | `spectrogram`| `[n_mels, frames]` |
//! | `f0`         | `[frames]`         |
//! | `f0t`        | `[labels + 1]`     |
//! | `pitch`      | `[10 ms frames]`   |
//! | `harmonics`  | `[128, frames]`    |
//! | `aperiodics` | `[128, frames]`    |
//! | `phase`      | `[frames]`         |

use std::fmt;
use std::str::FromStr;

use candle_core::{D, DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::audio::envelope::{self, EnvelopeAnalyzer};
use crate::audio::{
    F0Track, MelConfig, MelSpectrogram, PitchConfig, PitchTracker, detect_pitch_frequency, resample,
};
use crate::{Error, Result};

/// Envelope analysis FFT size; its first 128 bins become the feature rows.
const ENVELOPE_FFT_SIZE: usize = 256;
const ENVELOPE_BINS: usize = 128;

/// Token pitch below this is treated as unvoiced.
const F0T_VOICED_MIN: f64 = 100.0;
const F0T_NORM_LOW: f64 = 71.0;
const F0T_NORM_HIGH: f64 = 500.0;

/// A named input feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Spectrogram,
    Waveform,
    Pitch,
    F0,
    F0t,
    #[serde(alias = "harmonic")]
    Harmonics,
    #[serde(alias = "aperiodic")]
    Aperiodics,
    Phase,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 8] = [
        FeatureKind::Spectrogram,
        FeatureKind::Waveform,
        FeatureKind::Pitch,
        FeatureKind::F0,
        FeatureKind::F0t,
        FeatureKind::Harmonics,
        FeatureKind::Aperiodics,
        FeatureKind::Phase,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FeatureKind::Spectrogram => "spectrogram",
            FeatureKind::Waveform => "waveform",
            FeatureKind::Pitch => "pitch",
            FeatureKind::F0 => "f0",
            FeatureKind::F0t => "f0t",
            FeatureKind::Harmonics => "harmonics",
            FeatureKind::Aperiodics => "aperiodics",
            FeatureKind::Phase => "phase",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FeatureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "harmonic" => Ok(FeatureKind::Harmonics),
            "aperiodic" => Ok(FeatureKind::Aperiodics),
            name => FeatureKind::ALL
                .into_iter()
                .find(|kind| kind.name() == name)
                .ok_or_else(|| Error::UnknownFeature(s.to_string())),
        }
    }
}

/// How frame-level F0 is reduced to one value per label token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPitchMode {
    #[default]
    Mean,
    Median,
    Last,
}

/// Which features to compute, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRequest {
    #[serde(default)]
    pub waveform: bool,
    #[serde(default = "default_true")]
    pub spectrogram: bool,
    #[serde(default)]
    pub f0: bool,
    #[serde(default)]
    pub f0t: bool,
    #[serde(default)]
    pub pitch: bool,
    #[serde(default, alias = "harmonic")]
    pub harmonics: bool,
    #[serde(default, alias = "aperiodic")]
    pub aperiodics: bool,
    #[serde(default)]
    pub phase: bool,

    /// Rate the waveform is resampled to before analysis.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Frame step shared by the spectrogram and the F0 track.
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,

    #[serde(default)]
    pub mode: TokenPitchMode,

    /// Skip analysis and return fixed-shape zero tensors.
    #[serde(default)]
    pub dummy: bool,
}

impl Default for FeatureRequest {
    fn default() -> Self {
        Self {
            waveform: false,
            spectrogram: true,
            f0: false,
            f0t: false,
            pitch: false,
            harmonics: false,
            aperiodics: false,
            phase: false,
            sample_rate: default_sample_rate(),
            hop_length: default_hop_length(),
            mode: TokenPitchMode::default(),
            dummy: false,
        }
    }
}

impl FeatureRequest {
    /// Request exactly the given kinds.
    pub fn only(kinds: &[FeatureKind]) -> Self {
        let mut request = Self {
            spectrogram: false,
            ..Self::default()
        };
        for &kind in kinds {
            request.set(kind, true);
        }
        request
    }

    pub fn set(&mut self, kind: FeatureKind, on: bool) {
        let flag = match kind {
            FeatureKind::Spectrogram => &mut self.spectrogram,
            FeatureKind::Waveform => &mut self.waveform,
            FeatureKind::Pitch => &mut self.pitch,
            FeatureKind::F0 => &mut self.f0,
            FeatureKind::F0t => &mut self.f0t,
            FeatureKind::Harmonics => &mut self.harmonics,
            FeatureKind::Aperiodics => &mut self.aperiodics,
            FeatureKind::Phase => &mut self.phase,
        };
        *flag = on;
    }

    pub fn wants(&self, kind: FeatureKind) -> bool {
        match kind {
            FeatureKind::Spectrogram => self.spectrogram,
            FeatureKind::Waveform => self.waveform,
            FeatureKind::Pitch => self.pitch,
            FeatureKind::F0 => self.f0,
            FeatureKind::F0t => self.f0t,
            FeatureKind::Harmonics => self.harmonics,
            FeatureKind::Aperiodics => self.aperiodics,
            FeatureKind::Phase => self.phase,
        }
    }

    pub fn kinds(&self) -> Vec<FeatureKind> {
        FeatureKind::ALL
            .into_iter()
            .filter(|&kind| self.wants(kind))
            .collect()
    }

    fn needs_f0_track(&self) -> bool {
        self.f0 || self.f0t || self.phase || self.harmonics || self.aperiodics
    }
}

fn default_true() -> bool {
    true
}
fn default_sample_rate() -> u32 {
    16000
}
fn default_hop_length() -> usize {
    256
}

/// Features of one utterance plus its label ids.
#[derive(Debug, Clone, Default)]
pub struct AudioFeatures {
    pub waveform: Option<Tensor>,
    pub spectrogram: Option<Tensor>,
    pub f0: Option<Tensor>,
    pub f0t: Option<Tensor>,
    pub pitch: Option<Tensor>,
    pub harmonics: Option<Tensor>,
    pub aperiodics: Option<Tensor>,
    pub phase: Option<Tensor>,
    pub labels: Vec<u32>,
}

impl AudioFeatures {
    pub fn get(&self, kind: FeatureKind) -> Option<&Tensor> {
        match kind {
            FeatureKind::Spectrogram => self.spectrogram.as_ref(),
            FeatureKind::Waveform => self.waveform.as_ref(),
            FeatureKind::Pitch => self.pitch.as_ref(),
            FeatureKind::F0 => self.f0.as_ref(),
            FeatureKind::F0t => self.f0t.as_ref(),
            FeatureKind::Harmonics => self.harmonics.as_ref(),
            FeatureKind::Aperiodics => self.aperiodics.as_ref(),
            FeatureKind::Phase => self.phase.as_ref(),
        }
    }

    /// Like [`AudioFeatures::get`] but an error when the feature is missing.
    pub fn require(&self, kind: FeatureKind) -> Result<&Tensor> {
        self.get(kind)
            .ok_or_else(|| Error::Config(format!("feature '{kind}' was not extracted")))
    }

    /// Present features in [`FeatureKind::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (FeatureKind, &Tensor)> {
        FeatureKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|t| (kind, t)))
    }
}

/// Computes the requested features for single utterances.
pub struct FeatureExtractor {
    request: FeatureRequest,
    mel: MelSpectrogram,
    pitch: PitchTracker,
    envelope: EnvelopeAnalyzer,
}

impl FeatureExtractor {
    pub fn new(request: FeatureRequest) -> Result<Self> {
        if request.hop_length == 0 || request.sample_rate == 0 {
            return Err(Error::Config(format!(
                "invalid feature framing: sample_rate {}, hop_length {}",
                request.sample_rate, request.hop_length
            )));
        }
        let mel = MelSpectrogram::new(MelConfig {
            sample_rate: request.sample_rate,
            hop_length: request.hop_length,
            ..MelConfig::default()
        });
        let pitch = PitchTracker::new(PitchConfig {
            sample_rate: request.sample_rate,
            hop_length: request.hop_length,
            ..PitchConfig::default()
        })?;
        let envelope = EnvelopeAnalyzer::new(request.sample_rate, ENVELOPE_FFT_SIZE)?;
        Ok(Self {
            request,
            mel,
            pitch,
            envelope,
        })
    }

    pub fn request(&self) -> &FeatureRequest {
        &self.request
    }

    /// Extract features from mono samples recorded at `sample_rate`.
    pub fn extract(&self, samples: &[f64], sample_rate: u32, labels: &[u32]) -> Result<AudioFeatures> {
        if self.request.dummy {
            return dummy_features(labels);
        }
        if samples.is_empty() {
            return Err(Error::Audio("cannot extract features from an empty waveform".into()));
        }

        let resampled;
        let wav = if sample_rate != self.request.sample_rate {
            resampled = resample(samples, sample_rate, self.request.sample_rate)?;
            resampled.as_slice()
        } else {
            samples
        };
        let device = Device::Cpu;
        let mut features = AudioFeatures {
            labels: labels.to_vec(),
            ..AudioFeatures::default()
        };

        if self.request.waveform {
            features.waveform = Some(vec_to_tensor(wav, &device)?);
        }
        if self.request.spectrogram {
            features.spectrogram = Some(rows_to_tensor(&self.mel.process(wav), &device)?);
        }
        if self.request.pitch {
            let pitch = detect_pitch_frequency(wav, self.request.sample_rate);
            features.pitch = Some(vec_to_tensor(&pitch, &device)?);
        }

        if self.request.needs_f0_track() {
            let track = self.pitch.track(wav);
            if self.request.f0 {
                features.f0 = Some(vec_to_tensor(&track.f0, &device)?);
            }
            if self.request.f0t {
                let duration = wav.len() as f64 / self.request.sample_rate as f64;
                let values = f0t(&track, duration, labels.len(), self.request.mode);
                features.f0t = Some(vec_to_tensor(&values, &device)?);
            }
            if self.request.phase {
                features.phase = Some(vec_to_tensor(&phase(&track), &device)?);
            }
            if self.request.harmonics {
                let sp = self.envelope.spectral_envelope(wav, &track);
                let rows = envelope::to_feature_rows(&sp, ENVELOPE_BINS);
                features.harmonics = Some(rows_to_tensor(&rows, &device)?);
            }
            if self.request.aperiodics {
                let ap = self.envelope.aperiodicity(wav, &track);
                let rows = envelope::to_feature_rows(&ap, ENVELOPE_BINS);
                features.aperiodics = Some(rows_to_tensor(&rows, &device)?);
            }
        }

        for (kind, tensor) in features.iter() {
            tracing::debug!("['{kind}']: {:?}", tensor.dims());
        }
        tracing::debug!("['labels']: {}", features.labels.len());
        Ok(features)
    }
}

fn dummy_features(labels: &[u32]) -> Result<AudioFeatures> {
    let device = Device::Cpu;
    let frames = 100;
    Ok(AudioFeatures {
        spectrogram: Some(Tensor::zeros((128, frames), DType::F32, &device)?),
        f0: Some(Tensor::zeros(frames, DType::F32, &device)?),
        f0t: Some(Tensor::zeros(frames, DType::F32, &device)?),
        pitch: Some(Tensor::zeros(frames, DType::F32, &device)?),
        harmonics: Some(Tensor::zeros((ENVELOPE_BINS, frames), DType::F32, &device)?),
        aperiodics: Some(Tensor::zeros((ENVELOPE_BINS, frames), DType::F32, &device)?),
        labels: labels.to_vec(),
        ..AudioFeatures::default()
    })
}

fn vec_to_tensor(values: &[f64], device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    Tensor::from_vec(data, values.len(), device).map_err(Into::into)
}

fn rows_to_tensor(rows: &[Vec<f64>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != width) {
        return Err(Error::Audio("ragged feature rows".into()));
    }
    let data: Vec<f32> = rows.iter().flatten().map(|&v| v as f32).collect();
    Tensor::from_vec(data, (rows.len(), width), device).map_err(Into::into)
}

/// Token-aligned F0.
///
/// The utterance is split evenly over `num_tokens`; each token reduces the
/// F0 frames inside its span with `mode`. Values under 100 Hz become 0, the
/// first value is repeated for BOS, and voiced values are scaled by
/// `(f - 71) / (500 - 71)`. Returns `num_tokens + 1` values.
pub fn f0t(track: &F0Track, duration: f64, num_tokens: usize, mode: TokenPitchMode) -> Vec<f64> {
    if num_tokens == 0 {
        return vec![0.0];
    }
    let token_duration = duration / num_tokens as f64;
    let times = &track.times;

    let mut tokens: Vec<f64> = (0..num_tokens)
        .map(|i| {
            let start = i as f64 * token_duration;
            let end = start + token_duration;
            let lo = times.partition_point(|&t| t < start);
            let hi = times.partition_point(|&t| t <= end).max(lo + 1);
            let segment = &track.f0[lo.min(track.f0.len())..hi.min(track.f0.len())];
            reduce_segment(segment, mode)
        })
        .collect();

    for value in tokens.iter_mut() {
        if *value < F0T_VOICED_MIN {
            *value = 0.0;
        }
    }
    let bos = tokens[0];
    std::iter::once(bos)
        .chain(tokens)
        .map(|f| {
            if f == 0.0 {
                0.0
            } else {
                (f - F0T_NORM_LOW) / (F0T_NORM_HIGH - F0T_NORM_LOW)
            }
        })
        .collect()
}

fn reduce_segment(segment: &[f64], mode: TokenPitchMode) -> f64 {
    if segment.is_empty() {
        return 0.0;
    }
    match mode {
        TokenPitchMode::Mean => segment.iter().sum::<f64>() / segment.len() as f64,
        TokenPitchMode::Median => {
            let mut sorted = segment.to_vec();
            sorted.sort_by(f64::total_cmp);
            // Lower median for even lengths.
            sorted[(sorted.len() - 1) / 2]
        }
        TokenPitchMode::Last => segment[segment.len() - 1],
    }
}

/// Instantaneous phase `cumsum(2π·f0·Δt) mod 2π`, Δt the mean frame step.
pub fn phase(track: &F0Track) -> Vec<f64> {
    let tau = 2.0 * std::f64::consts::PI;
    let step = track.frame_step();
    let mut phi = 0.0;
    track
        .f0
        .iter()
        .map(|&f| {
            phi += tau * f * step;
            phi.rem_euclid(tau)
        })
        .collect()
}

/// Resample the last axis of a pitch tensor to `target_len`.
///
/// Adaptive average pooling when the track is longer, nearest-neighbour
/// interpolation otherwise.
pub fn tokenize_pitch(pitch: &Tensor, target_len: usize) -> Result<Tensor> {
    let len = pitch.dim(D::Minus1)?;
    if len > target_len {
        adaptive_avg_pool1d(pitch, target_len)
    } else {
        if len == 0 {
            return Err(Error::shape("tokenize_pitch", pitch.dims()));
        }
        let index: Vec<u32> = (0..target_len)
            .map(|i| ((i * len) / target_len) as u32)
            .collect();
        let index = Tensor::new(index.as_slice(), pitch.device())?;
        pitch.index_select(&index, pitch.rank() - 1).map_err(Into::into)
    }
}

/// Adaptive average pooling over the last axis.
///
/// Output bin `t` averages inputs `floor(t·L/T) .. ceil((t+1)·L/T)`.
pub fn adaptive_avg_pool1d(x: &Tensor, target_len: usize) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let len = x.dim(D::Minus1)?;
    if len == 0 || target_len == 0 {
        return Err(Error::shape("adaptive_avg_pool1d", &dims));
    }
    let mut weights = vec![0f32; len * target_len];
    for t in 0..target_len {
        let start = t * len / target_len;
        let end = ((t + 1) * len).div_ceil(target_len);
        let w = 1.0 / (end - start) as f32;
        for l in start..end {
            weights[l * target_len + t] = w;
        }
    }
    let pool = Tensor::from_vec(weights, (len, target_len), x.device())?.to_dtype(x.dtype())?;

    let lead: usize = dims[..dims.len() - 1].iter().product();
    let mut out_dims = dims;
    if let Some(last) = out_dims.last_mut() {
        *last = target_len;
    }
    x.reshape((lead, len))?
        .matmul(&pool)?
        .reshape(out_dims)
        .map_err(Into::into)
}

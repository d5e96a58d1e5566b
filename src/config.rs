//! Configuration for the echo speech model.
//!
//! Every field has a serde default so partial JSON files load cleanly, the
//! same way a model `config.json` is merged over built-in defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::features::FeatureKind;
use crate::{Error, Result};

/// Iterative-refinement attention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Hard cap on refinement passes.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Initial value of the learned convergence threshold.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Initial value of the learned threshold scaling factor.
    #[serde(default = "default_s_factor")]
    pub s_factor: f64,

    /// Dropout probability used by blocks built around the attention.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Apply a causal mask when no explicit mask is given.
    #[serde(default = "default_true")]
    pub causal: bool,

    /// Restrict self-attention to sliding windows.
    #[serde(default)]
    pub sliding_window: Option<SlidingWindow>,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            threshold: default_threshold(),
            s_factor: default_s_factor(),
            dropout: default_dropout(),
            causal: true,
            sliding_window: None,
        }
    }
}

/// Window geometry for sliding-window attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindow {
    /// Query positions per window.
    pub win_size: usize,
    /// Trailing key/value span each window attends over.
    pub span_len: usize,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self {
            win_size: 512,
            span_len: 1024,
        }
    }
}

/// Top-level model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Maximum decoder length (also the generation cap).
    #[serde(default = "default_text_ctx")]
    pub text_ctx: usize,

    /// Number of mel (or envelope) bins fed to the spectrogram encoder.
    #[serde(default = "default_mels")]
    pub mels: usize,

    /// Model width.
    #[serde(default = "default_dims")]
    pub dims: usize,

    /// Attention heads; must divide `dims`.
    #[serde(default = "default_head")]
    pub head: usize,

    #[serde(default = "default_encoder_layers")]
    pub encoder_layers: usize,

    #[serde(default = "default_decoder_layers")]
    pub decoder_layers: usize,

    /// Activation name used by the feature encoders.
    #[serde(default = "default_activation")]
    pub activation: String,

    /// Which input feature the model consumes.
    #[serde(default = "default_feature")]
    pub feature: FeatureKind,

    /// Apply rotary embeddings in the feature encoder instead of sinusoids.
    #[serde(default)]
    pub use_rope: bool,

    /// Timescale of the additive sinusoid positions.
    #[serde(default = "default_max_tscale")]
    pub max_tscale: f64,

    /// Waveform encoder output length (adaptive pooling), if fixed.
    #[serde(default)]
    pub target_length: Option<usize>,

    /// Dropout applied inside the feature encoders.
    #[serde(default = "default_encoder_dropout")]
    pub encoder_dropout: f32,

    #[serde(default)]
    pub attention: AttentionConfig,

    #[serde(default)]
    pub pad_token_id: u32,

    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,

    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            text_ctx: default_text_ctx(),
            mels: default_mels(),
            dims: default_dims(),
            head: default_head(),
            encoder_layers: default_encoder_layers(),
            decoder_layers: default_decoder_layers(),
            activation: default_activation(),
            feature: default_feature(),
            use_rope: false,
            max_tscale: default_max_tscale(),
            target_length: None,
            encoder_dropout: default_encoder_dropout(),
            attention: AttentionConfig::default(),
            pad_token_id: 0,
            bos_token_id: default_bos_token_id(),
            eos_token_id: default_eos_token_id(),
        }
    }
}

impl EchoConfig {
    /// Load a config from a JSON file, filling missing fields with defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Dimension per attention head.
    pub fn head_dim(&self) -> usize {
        self.dims / self.head
    }

    /// Check the structural invariants the model relies on.
    pub fn validate(&self) -> Result<()> {
        check_heads(self.dims, self.head)?;
        if self.head_dim() % 2 != 0 {
            return Err(Error::Config(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        if self.dims % 4 != 0 {
            return Err(Error::Config(format!(
                "dims {} must be divisible by 4 for the waveform encoder",
                self.dims
            )));
        }
        if self.attention.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be at least 1".into()));
        }
        if let Some(window) = self.attention.sliding_window {
            check_window(window)?;
        }
        Ok(())
    }

    /// Generation defaults derived from this config.
    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            max_length: self.text_ctx,
            pad_token_id: self.pad_token_id,
            bos_token_id: self.bos_token_id,
            eos_token_id: self.eos_token_id,
            ..GenerationConfig::default()
        }
    }
}

/// Decoding settings for [`crate::model::EchoModel::generate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_text_ctx")]
    pub max_length: usize,

    /// Sample from the top-k distribution instead of greedy argmax.
    #[serde(default)]
    pub do_sample: bool,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// RNG seed for sampling.
    #[serde(default)]
    pub seed: u64,

    #[serde(default)]
    pub pad_token_id: u32,

    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,

    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: default_text_ctx(),
            do_sample: false,
            top_k: default_top_k(),
            temperature: default_temperature(),
            seed: 0,
            pad_token_id: 0,
            bos_token_id: default_bos_token_id(),
            eos_token_id: default_eos_token_id(),
        }
    }
}

impl GenerationConfig {
    /// Same settings with top-k sampling switched on.
    pub fn sampling(&self, top_k: usize) -> Self {
        Self {
            do_sample: true,
            top_k,
            ..self.clone()
        }
    }
}

pub(crate) fn check_heads(dims: usize, head: usize) -> Result<()> {
    if head == 0 || dims % head != 0 {
        return Err(Error::Config(format!(
            "dims {dims} must be divisible by head count {head}"
        )));
    }
    Ok(())
}

pub(crate) fn check_window(window: SlidingWindow) -> Result<()> {
    if window.win_size == 0 || window.span_len == 0 {
        return Err(Error::Config(format!(
            "sliding window needs non-zero sizes, got {window:?}"
        )));
    }
    Ok(())
}

fn default_max_iterations() -> usize {
    3
}
fn default_threshold() -> f64 {
    0.01
}
fn default_s_factor() -> f64 {
    0.1
}
fn default_dropout() -> f32 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_vocab_size() -> usize {
    40000
}
fn default_text_ctx() -> usize {
    128
}
fn default_mels() -> usize {
    128
}
fn default_dims() -> usize {
    512
}
fn default_head() -> usize {
    8
}
fn default_encoder_layers() -> usize {
    4
}
fn default_decoder_layers() -> usize {
    4
}
fn default_activation() -> String {
    "gelu".to_string()
}
fn default_feature() -> FeatureKind {
    FeatureKind::Spectrogram
}
fn default_max_tscale() -> f64 {
    10000.0
}
fn default_encoder_dropout() -> f32 {
    0.01
}
fn default_bos_token_id() -> u32 {
    1
}
fn default_eos_token_id() -> u32 {
    2
}
fn default_top_k() -> usize {
    5
}
fn default_temperature() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EchoConfig::default();
        config.validate().unwrap();
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.attention.max_iterations, 3);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let json = r#"{"dims": 256, "head": 4, "feature": "waveform",
                       "attention": {"max_iterations": 5}}"#;
        let config: EchoConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.dims, 256);
        assert_eq!(config.feature, FeatureKind::Waveform);
        assert_eq!(config.attention.max_iterations, 5);
        // Unspecified fields should use defaults.
        assert!((config.attention.threshold - 0.01).abs() < 1e-12);
        assert_eq!(config.eos_token_id, 2);
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let config = EchoConfig {
            dims: 100,
            head: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = EchoConfig::default();
        config.attention.sliding_window = Some(SlidingWindow {
            win_size: 0,
            span_len: 4,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generation_config_follows_model_ids() {
        let config = EchoConfig {
            text_ctx: 64,
            eos_token_id: 9,
            ..Default::default()
        };
        let generation = config.generation_config();
        assert_eq!(generation.max_length, 64);
        assert_eq!(generation.eos_token_id, 9);
        assert!(!generation.do_sample);
        assert!(generation.sampling(5).do_sample);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"vocab_size": 1000, "text_ctx": 32}"#).unwrap();
        let config = EchoConfig::from_json_file(&path).unwrap();
        assert_eq!(config.vocab_size, 1000);
        assert_eq!(config.text_ctx, 32);
    }
}

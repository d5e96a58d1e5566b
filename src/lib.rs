//! Speech sequence-model building blocks in pure Rust.
//!
//! A candle-based collection of the pieces an experimental speech recognizer
//! is assembled from: attention variants, audio feature extraction,
//! positional encodings, and the glue that turns model outputs into
//! training signals.
//!
//! ## Architecture
//!
//! ```text
//! waveform ─→ features (mel / waveform / F0 / envelope / aperiodicity)
//!                 ↓
//!          feature encoder (conv stack + positions + RMSNorm)
//!                 ↓
//!          iterative-refinement attention blocks (optionally windowed)
//!                 ↓
//! token ids ─→ decoder (cached causal self-attn + cross-attn) ─→ logits
//!                 ↓
//!          collation, WER, self-training / self-critical losses
//! ```
//!
//! ## Modules
//!
//! - [`audio`]: WAV I/O, STFT, mel spectrogram, MFCC, F0, envelope, Hilbert
//! - [`features`]: per-utterance feature extraction into tensors
//! - [`model`]: attention, masks, positions, encoders, the `EchoModel`
//! - [`training`]: collator, metrics, tokenizer, RL and self-training losses
//! - [`config`]: JSON-loadable model and generation configuration

pub mod audio;
pub mod config;
pub mod features;
pub mod model;
pub mod training;

mod error;

pub use error::{Error, Result};

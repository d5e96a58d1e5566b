//! Model components for echo.
//!
//! ## Components
//!
//! - [`attention`]: multi-head, iterative refinement, sliding-window and
//!   experimental attention variants
//! - [`encoder`]: conv feature encoders for spectrogram, waveform and pitch
//! - [`echo`]: the encoder/decoder that turns features and ids into logits
//! - [`positional`], [`rope`]: absolute and rotary positions
//! - [`mask`], [`kv_cache`], [`activation`], [`gate`]: shared pieces

pub mod activation;
pub mod attention;
pub mod echo;
pub mod encoder;
pub mod gate;
pub mod kv_cache;
pub mod mask;
pub mod positional;
pub mod rope;

pub use activation::Activation;
pub use attention::{IterativeAttention, MultiHeadAttention, SlidingWindowAttention};
pub use echo::{EchoModel, SpeechSeq2Seq};
pub use encoder::{EncoderOptions, FeatureEncoder, build_feature_encoder};
pub use gate::TypeGate;
pub use kv_cache::KvCache;
pub use positional::{LearnedSinusoids, PositionalEncoding, sinusoids};
pub use rope::RotaryEmbedding;

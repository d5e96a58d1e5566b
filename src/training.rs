//! Training and evaluation glue.
//!
//! - [`collator`]: pads labels and features into batches
//! - [`metrics`]: WER, id cleanup, evaluation metrics
//! - [`tokenizer`]: transcript tokenizer with pad/BOS/EOS handling
//! - [`loss`]: masked cross-entropy and sequence log-probabilities
//! - [`self_critical`], [`self_training`]: losses driven by the model's own
//!   generations

pub mod collator;
pub mod loss;
pub mod metrics;
pub mod self_critical;
pub mod self_training;
pub mod tokenizer;

use candle_core::{DType, Tensor};

use crate::Result;
use crate::config::GenerationConfig;
use crate::model::SpeechSeq2Seq;

pub use collator::{Batch, DataCollator, Example};
pub use loss::{masked_cross_entropy, sequence_log_prob};
pub use metrics::{
    Metrics, argmax_predictions, clean_batch, clean_ids, compute_metrics, levenshtein,
    trainable_params, wer_batch, wer_reward,
};
pub use self_critical::{SelfCriticalOutput, SelfCriticalTrainer};
pub use self_training::{PseudoLabels, SelfTrainer, confidence};
pub use tokenizer::{SpecialTokens, SpeechTokenizer, TokenDecoder};

/// The model's generation defaults with `max_length` in place.
fn capped_generation<M: SpeechSeq2Seq>(model: &M, max_length: usize) -> GenerationConfig {
    GenerationConfig {
        max_length,
        ..model.config().generation_config()
    }
}

fn id_rows(ids: &Tensor) -> Result<Vec<Vec<i64>>> {
    Ok(ids.to_dtype(DType::I64)?.to_vec2::<i64>()?)
}

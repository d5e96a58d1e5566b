//! Self-critical sequence training.
//!
//! A sampled transcript is rewarded relative to the model's own greedy
//! transcript:
//!
//! ```text
//! advantage = reward(sample, ref) - reward(greedy, ref)
//! loss      = -mean(advantage · Σₜ log p(sampleₜ))
//! ```

use candle_core::{DType, Tensor};

use super::loss::sequence_log_prob;
use super::metrics::wer_reward;
use super::tokenizer::TokenDecoder;
use super::{capped_generation, id_rows};
use crate::config::GenerationConfig;
use crate::model::SpeechSeq2Seq;
use crate::{Error, Result};

/// Loss and the rewards it was computed from.
#[derive(Debug, Clone)]
pub struct SelfCriticalOutput {
    pub loss: Tensor,
    pub rewards: Vec<f64>,
    pub baseline: Vec<f64>,
}

pub struct SelfCriticalTrainer<R> {
    reward_fn: R,
    top_k: usize,
    max_length: usize,
    seed: u64,
}

impl SelfCriticalTrainer<fn(&str, &str) -> f64> {
    /// Negative WER as the reward.
    pub fn with_wer_reward(max_length: usize) -> Self {
        Self::new(wer_reward, max_length)
    }
}

impl<R: Fn(&str, &str) -> f64> SelfCriticalTrainer<R> {
    /// `reward_fn(hypothesis, reference)`; samples are drawn from the top 5.
    pub fn new(reward_fn: R, max_length: usize) -> Self {
        Self {
            reward_fn,
            top_k: 5,
            max_length,
            seed: 0,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// One self-critical loss for a batch.
    ///
    /// - `input_ids`: `[B, P]` generation prompt
    /// - `features`: the model's feature tensor for the batch
    /// - `labels`: reference ids per row (special ids are ignored)
    pub fn loss<M: SpeechSeq2Seq, T: TokenDecoder>(
        &self,
        model: &M,
        tokenizer: &T,
        input_ids: &Tensor,
        features: &Tensor,
        labels: &[Vec<i64>],
    ) -> Result<SelfCriticalOutput> {
        let batch = input_ids.dim(0)?;
        if labels.len() != batch {
            return Err(Error::UnsupportedShape(format!(
                "{} reference rows for a batch of {batch}",
                labels.len()
            )));
        }

        let greedy_config = capped_generation(model, self.max_length);
        let sample_config = GenerationConfig {
            seed: self.seed,
            ..greedy_config.sampling(self.top_k)
        };

        let greedy_ids = model.generate(input_ids, features, &greedy_config)?;
        let sampled_ids = model.generate(input_ids, features, &sample_config)?;
        let greedy_text = tokenizer.batch_decode(&id_rows(&greedy_ids)?)?;
        let sampled_text = tokenizer.batch_decode(&id_rows(&sampled_ids)?)?;

        let mut rewards = Vec::with_capacity(batch);
        let mut baseline = Vec::with_capacity(batch);
        for ((sample, greedy), reference) in sampled_text.iter().zip(&greedy_text).zip(labels) {
            let reference = tokenizer.decode(reference)?;
            rewards.push((self.reward_fn)(sample, &reference));
            baseline.push((self.reward_fn)(greedy, &reference));
        }

        let device = input_ids.device();
        let advantage: Vec<f32> = rewards
            .iter()
            .zip(&baseline)
            .map(|(r, b)| (r - b) as f32)
            .collect();
        let advantage = Tensor::from_vec(advantage, batch, device)?;

        let logits = model.logits(&sampled_ids, features, true)?;
        let log_prob_sum = sequence_log_prob(&logits, &sampled_ids)?;
        let loss = (log_prob_sum.to_dtype(DType::F32)? * &advantage)?.mean_all()?.neg()?;

        tracing::debug!(
            mean_reward = rewards.iter().sum::<f64>() / batch.max(1) as f64,
            mean_baseline = baseline.iter().sum::<f64>() / batch.max(1) as f64,
            "self-critical step"
        );
        Ok(SelfCriticalOutput {
            loss,
            rewards,
            baseline,
        })
    }
}

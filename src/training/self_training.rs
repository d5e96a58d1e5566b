//! Self-training on unlabeled audio with the model's own transcripts.

use candle_core::{D, DType, Tensor};

use super::id_rows;
use super::loss::masked_cross_entropy;
use crate::config::GenerationConfig;
use crate::model::SpeechSeq2Seq;
use crate::{Error, Result};

/// Mean over positions of the highest token probability, per row.
///
/// `pred_ids`: `[B, S]` → `B` values in `(0, 1]`.
pub fn confidence<M: SpeechSeq2Seq>(model: &M, pred_ids: &Tensor, features: &Tensor) -> Result<Vec<f32>> {
    let logits = model.logits(pred_ids, features, false)?;
    let probs = candle_nn::ops::softmax_last_dim(&logits)?;
    Ok(probs
        .max(D::Minus1)?
        .mean(1)?
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()?)
}

/// Generated transcripts kept for training, with their batch rows.
#[derive(Debug, Clone)]
pub struct PseudoLabels {
    /// `[B_kept, L]` u32, prompt included.
    pub ids: Tensor,
    /// Rows of the original batch that were kept.
    pub rows: Vec<usize>,
    /// `features` restricted to `rows`.
    pub features: Tensor,
    pub confidence: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct SelfTrainer {
    /// Minimum confidence a pseudo label needs, when filtering.
    pub threshold: f32,
    /// Filter rows by [`confidence`].
    pub filter: bool,
    pub max_length: usize,
    pub pad_token_id: u32,
}

impl SelfTrainer {
    pub fn new(max_length: usize) -> Self {
        Self {
            threshold: 0.8,
            filter: true,
            max_length,
            pad_token_id: 0,
        }
    }

    /// Greedy transcripts for `prompt`, optionally keeping only rows above
    /// the confidence threshold. `None` when no row survives.
    pub fn pseudo_labels<M: SpeechSeq2Seq>(
        &self,
        model: &M,
        prompt: &Tensor,
        features: &Tensor,
    ) -> Result<Option<PseudoLabels>> {
        let generation = GenerationConfig {
            pad_token_id: self.pad_token_id,
            ..super::capped_generation(model, self.max_length)
        };
        let ids = model.generate(prompt, features, &generation)?;
        let batch = ids.dim(0)?;

        if !self.filter {
            return Ok(Some(PseudoLabels {
                ids,
                rows: (0..batch).collect(),
                features: features.clone(),
                confidence: None,
            }));
        }

        let scores = confidence(model, &ids, features)?;
        let rows: Vec<usize> = scores
            .iter()
            .enumerate()
            .filter(|&(_, &score)| score > self.threshold)
            .map(|(row, _)| row)
            .collect();
        tracing::debug!(kept = rows.len(), batch, threshold = self.threshold, "pseudo labels");
        if rows.is_empty() {
            return Ok(None);
        }

        let index: Vec<u32> = rows.iter().map(|&row| row as u32).collect();
        let index = Tensor::new(index.as_slice(), ids.device())?;
        Ok(Some(PseudoLabels {
            ids: ids.index_select(&index, 0)?,
            features: features.index_select(&index.to_device(features.device())?, 0)?,
            rows,
            confidence: Some(scores),
        }))
    }

    /// Teacher-forced cross-entropy on the pseudo labels (pad ignored).
    ///
    /// `None` when no row was kept or the transcripts have no tokens past
    /// the prompt.
    pub fn loss<M: SpeechSeq2Seq>(&self, model: &M, prompt: &Tensor, features: &Tensor) -> Result<Option<Tensor>> {
        let Some(labels) = self.pseudo_labels(model, prompt, features)? else {
            return Ok(None);
        };
        let len = labels.ids.dim(1)?;
        if len < 2 {
            return Ok(None);
        }
        let inputs = labels.ids.narrow(1, 0, len - 1)?;
        let targets = labels.ids.narrow(1, 1, len - 1)?;
        let logits = model.logits(&inputs, &labels.features, true)?;
        masked_cross_entropy(&logits, &targets, Some(self.pad_token_id)).map(Some)
    }
}

/// Row-wise ids of a pseudo-label batch, for decoding.
pub fn pseudo_label_rows(labels: &PseudoLabels) -> Result<Vec<Vec<i64>>> {
    if labels.ids.rank() != 2 {
        return Err(Error::shape("pseudo labels", labels.ids.dims()));
    }
    id_rows(&labels.ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EchoConfig;
    use crate::model::EchoModel;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_model(varmap: &VarMap) -> EchoModel {
        let config = EchoConfig {
            vocab_size: 10,
            text_ctx: 8,
            mels: 4,
            dims: 16,
            head: 2,
            encoder_layers: 1,
            decoder_layers: 1,
            ..EchoConfig::default()
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        EchoModel::load(vb, &config).unwrap()
    }

    fn batch(rows: usize) -> (Tensor, Tensor) {
        let features = Tensor::randn(0f32, 1.0, (rows, 4, 10), &Device::Cpu).unwrap();
        let prompt = Tensor::ones((rows, 1), DType::U32, &Device::Cpu).unwrap();
        (prompt, features)
    }

    #[test]
    fn test_confidence_is_a_probability() {
        let varmap = VarMap::new();
        let model = tiny_model(&varmap);
        let (prompt, features) = batch(3);
        let scores = confidence(&model, &prompt, &features).unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores.iter().all(|&s| s > 0.0 && s <= 1.0));
    }

    #[test]
    fn test_unfiltered_keeps_every_row() {
        let varmap = VarMap::new();
        let model = tiny_model(&varmap);
        let (prompt, features) = batch(2);
        let trainer = SelfTrainer {
            filter: false,
            ..SelfTrainer::new(5)
        };
        let labels = trainer.pseudo_labels(&model, &prompt, &features).unwrap().unwrap();
        assert_eq!(labels.rows, vec![0, 1]);
        assert_eq!(pseudo_label_rows(&labels).unwrap().len(), 2);

        let loss = trainer.loss(&model, &prompt, &features).unwrap();
        if let Some(loss) = loss {
            assert!(loss.to_scalar::<f32>().unwrap().is_finite());
        }
    }

    #[test]
    fn test_threshold_above_one_keeps_nothing() {
        let varmap = VarMap::new();
        let model = tiny_model(&varmap);
        let (prompt, features) = batch(2);
        let trainer = SelfTrainer {
            threshold: 1.5,
            ..SelfTrainer::new(5)
        };
        assert!(trainer.pseudo_labels(&model, &prompt, &features).unwrap().is_none());
        assert!(trainer.loss(&model, &prompt, &features).unwrap().is_none());
    }

    #[test]
    fn test_threshold_zero_keeps_all_with_scores() {
        let varmap = VarMap::new();
        let model = tiny_model(&varmap);
        let (prompt, features) = batch(2);
        let trainer = SelfTrainer {
            threshold: 0.0,
            ..SelfTrainer::new(5)
        };
        let labels = trainer.pseudo_labels(&model, &prompt, &features).unwrap().unwrap();
        assert_eq!(labels.rows.len(), 2);
        assert_eq!(labels.features.dims(), &[2, 4, 10]);
        assert_eq!(labels.confidence.map(|c| c.len()), Some(2));
    }
}

//! Word error rate and evaluation metrics.

use candle_core::{D, DType, Tensor};
use candle_nn::VarMap;
use serde::Serialize;

use super::tokenizer::{SpecialTokens, TokenDecoder};
use crate::Result;

/// Label value excluded from metrics and losses.
pub const IGNORE_INDEX: i64 = -100;

/// Edit distance between two token sequences.
pub fn levenshtein<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> usize {
    let mut prev: Vec<usize> = (0..=hypothesis.len()).collect();
    let mut row = vec![0; hypothesis.len() + 1];
    for (i, r) in reference.iter().enumerate() {
        row[0] = i + 1;
        for (j, h) in hypothesis.iter().enumerate() {
            row[j + 1] = if r == h {
                prev[j]
            } else {
                1 + prev[j].min(prev[j + 1]).min(row[j])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[hypothesis.len()]
}

/// Corpus WER in percent over lower-cased whitespace words.
///
/// Zero when the references contain no words.
pub fn wer_batch<R: AsRef<str>, H: AsRef<str>>(references: &[R], hypotheses: &[H]) -> f64 {
    let mut errors = 0;
    let mut words = 0;
    for (reference, hypothesis) in references.iter().zip(hypotheses) {
        let reference = reference.as_ref().to_lowercase();
        let hypothesis = hypothesis.as_ref().to_lowercase();
        let ref_words: Vec<&str> = reference.split_whitespace().collect();
        let hyp_words: Vec<&str> = hypothesis.split_whitespace().collect();
        errors += levenshtein(&ref_words, &hyp_words);
        words += ref_words.len();
    }
    if words == 0 {
        0.0
    } else {
        errors as f64 / words as f64 * 100.0
    }
}

/// Negative sentence WER as a fraction; case-sensitive.
pub fn wer_reward(hypothesis: &str, reference: &str) -> f64 {
    let hyp_words: Vec<&str> = hypothesis.split_whitespace().collect();
    let ref_words: Vec<&str> = reference.split_whitespace().collect();
    -(levenshtein(&ref_words, &hyp_words) as f64 / ref_words.len().max(1) as f64)
}

/// Drop `-100`, pad, BOS and EOS.
pub fn clean_ids(ids: &[i64], special: SpecialTokens) -> Vec<u32> {
    ids.iter()
        .copied()
        .filter(|&id| {
            id != IGNORE_INDEX
                && id != special.pad as i64
                && id != special.bos as i64
                && id != special.eos as i64
        })
        .filter_map(|id| u32::try_from(id).ok())
        .collect()
}

pub fn clean_batch(batch: &[Vec<i64>], special: SpecialTokens) -> Vec<Vec<u32>> {
    batch.iter().map(|ids| clean_ids(ids, special)).collect()
}

/// Greedy ids from logits `[B, S, V]`.
pub fn argmax_predictions(logits: &Tensor) -> Result<Vec<Vec<i64>>> {
    Ok(logits
        .argmax(D::Minus1)?
        .to_dtype(DType::I64)?
        .to_vec2::<i64>()?)
}

/// Total element count of every variable in `varmap`.
pub fn trainable_params(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|var| var.elem_count()).sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub wer: f64,
    /// `(100 - wer)` per million trainable parameters, 0 when unknown.
    pub efficiency_score: f64,
}

/// WER of `predictions` against `labels`, both raw id rows.
///
/// The first `num_samples` pairs are logged at debug level.
pub fn compute_metrics<T: TokenDecoder>(
    predictions: &[Vec<i64>],
    labels: &[Vec<i64>],
    tokenizer: &T,
    trainable_params: Option<usize>,
    num_samples: usize,
) -> Result<Metrics> {
    let special = tokenizer.special_tokens();
    let pred_ids = clean_batch(predictions, special);
    let label_ids = clean_batch(labels, special);
    let pred_str = pred_ids
        .iter()
        .map(|ids| tokenizer.decode_clean(ids))
        .collect::<Result<Vec<_>>>()?;
    let label_str = label_ids
        .iter()
        .map(|ids| tokenizer.decode_clean(ids))
        .collect::<Result<Vec<_>>>()?;

    for i in 0..num_samples.min(pred_ids.len()).min(label_ids.len()) {
        tracing::debug!(
            pred_tokens = ?pred_ids[i],
            label_tokens = ?label_ids[i],
            pred = %pred_str[i],
            label = %label_str[i],
            "sample"
        );
    }

    let wer = wer_batch(&label_str, &pred_str);
    let params_millions = trainable_params.unwrap_or(0) as f64 / 1_000_000.0;
    let efficiency_score = if params_millions > 0.0 {
        (100.0 - wer) / params_millions
    } else {
        0.0
    };
    Ok(Metrics {
        wer,
        efficiency_score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Decodes id `n` as the word `w{n}`.
    struct Words;

    impl TokenDecoder for Words {
        fn special_tokens(&self) -> SpecialTokens {
            SpecialTokens::default()
        }

        fn decode_clean(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().map(|id| format!("w{id}")).collect::<Vec<_>>().join(" "))
        }
    }

    #[test]
    fn test_levenshtein_distances() {
        assert_eq!(levenshtein(&["a", "b", "c"], &["a", "b", "c"]), 0);
        assert_eq!(levenshtein(&["a", "b", "c"], &["a", "x", "c"]), 1);
        assert_eq!(levenshtein(&["a", "b"], &[]), 2);
        assert_eq!(levenshtein::<&str>(&[], &["a"]), 1);
        assert_eq!(levenshtein(&["k", "i", "t", "t", "e", "n"], &["s", "i", "t", "t", "i", "n", "g"]), 3);
    }

    #[test]
    fn test_wer_of_identical_text_is_zero() {
        assert_eq!(wer_batch(&["Hello World"], &["hello world"]), 0.0);
        assert_eq!(wer_reward("the cat", "the cat"), 0.0);
    }

    #[test]
    fn test_wer_batch_is_percent_over_corpus() {
        let refs = ["a b c d", "e f"];
        let hyps = ["a b x d", "e"];
        assert!((wer_batch(&refs, &hyps) - 2.0 / 6.0 * 100.0).abs() < 1e-9);
        assert_eq!(wer_batch(&[""], &["anything"]), 0.0);
    }

    #[test]
    fn test_wer_reward_is_negative_and_case_sensitive() {
        assert!((wer_reward("The cat", "the cat") + 0.5).abs() < 1e-12);
        assert_eq!(wer_reward("words", ""), -1.0);
    }

    #[test]
    fn test_clean_drops_specials() {
        let special = SpecialTokens::default();
        assert_eq!(clean_ids(&[1, 5, 0, -100, 7, 2], special), vec![5, 7]);
        assert_eq!(
            clean_batch(&[vec![1, 3, 2], vec![-100, -100]], special),
            vec![vec![3], vec![]]
        );
    }

    #[test]
    fn test_argmax_over_vocab() {
        let logits = Tensor::new(
            &[[[0.1f32, 0.9, 0.0], [2.0, 1.0, 0.5]], [[0.0, 0.0, 3.0], [0.2, 0.1, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(argmax_predictions(&logits).unwrap(), vec![vec![1, 0], vec![2, 0]]);
    }

    #[test]
    fn test_metrics_with_and_without_params() {
        let preds = vec![vec![1, 5, 6, 2], vec![1, 7, 2, 0]];
        let labels = vec![vec![5, 6, 2, -100], vec![8, 2, -100, -100]];
        let metrics = compute_metrics(&preds, &labels, &Words, None, 2).unwrap();
        assert!((metrics.wer - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.efficiency_score, 0.0);

        let metrics = compute_metrics(&preds, &labels, &Words, Some(2_000_000), 0).unwrap();
        assert!((metrics.efficiency_score - (100.0 - 100.0 / 3.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_counts_varmap_parameters() {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _linear = candle_nn::linear(4, 3, vb.pp("proj")).unwrap();
        assert_eq!(trainable_params(&varmap), 4 * 3 + 3);
    }
}

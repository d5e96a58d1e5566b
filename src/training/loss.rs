//! Token-level losses.

use candle_core::{D, DType, Tensor};

use crate::{Error, Result};

/// Mean cross-entropy over targets that are not `ignore_index`.
///
/// `logits`: `[B, S, V]` or `[N, V]`; `targets`: `[B, S]` or `[N]` ids.
/// Returns a scalar; zero when every target is ignored.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, ignore_index: Option<u32>) -> Result<Tensor> {
    let vocab = logits.dim(D::Minus1)?;
    let logits = logits.reshape(((), vocab))?;
    let targets = targets.flatten_all()?.to_dtype(DType::U32)?;
    if targets.dim(0)? != logits.dim(0)? {
        return Err(Error::UnsupportedShape(format!(
            "cross entropy: {} targets for {} logit rows",
            targets.dim(0)?,
            logits.dim(0)?
        )));
    }

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?;
    let Some(ignore) = ignore_index else {
        return Ok(picked.mean_all()?.neg()?);
    };

    let keep = targets.ne(ignore)?.to_dtype(picked.dtype())?;
    let count = keep.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Ok(Tensor::zeros((), picked.dtype(), picked.device())?);
    }
    Ok(((picked * keep)?.sum_all()? / count as f64)?.neg()?)
}

/// Per-row sum of `log p(ids)` under `logits`.
///
/// `logits`: `[B, S, V]`; `ids`: `[B, S]`. Returns `[B]`.
pub fn sequence_log_prob(logits: &Tensor, ids: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let ids = ids.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?;
    Ok(log_probs.gather(&ids, D::Minus1)?.squeeze(D::Minus1)?.sum(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1u32, 2, 3], [0, 1, 2]], &Device::Cpu).unwrap();
        let loss: f32 = masked_cross_entropy(&logits, &targets, None)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_ignored_targets_do_not_count() {
        // Row 0 predicts class 1 confidently; row 1 is wrong but ignored.
        let logits = Tensor::new(&[[0f32, 10.0, 0.0], [10.0, 0.0, 0.0]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32, 0], &Device::Cpu).unwrap();
        let masked: f32 = masked_cross_entropy(&logits, &targets, Some(0))
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(masked < 1e-3);

        let all_ignored = Tensor::new(&[0u32, 0], &Device::Cpu).unwrap();
        let zero: f32 = masked_cross_entropy(&logits, &all_ignored, Some(0))
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(zero, 0.0);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let logits = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32, 2], &Device::Cpu).unwrap();
        assert!(masked_cross_entropy(&logits, &targets, None).is_err());
    }

    #[test]
    fn test_sequence_log_prob_sums_rows() {
        let logits = Tensor::zeros((2, 5, 8), DType::F32, &Device::Cpu).unwrap();
        let ids = Tensor::zeros((2, 5), DType::U32, &Device::Cpu).unwrap();
        let sums: Vec<f32> = sequence_log_prob(&logits, &ids).unwrap().to_vec1().unwrap();
        for sum in sums {
            assert!((sum + 5.0 * 8f32.ln()).abs() < 1e-4);
        }
    }
}

//! Alternative attention scores: cosine similarity and RBF blends.

use candle_core::{D, Tensor};

use crate::Result;
use crate::model::mask::as_4d;

fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .clamp(1e-12, f64::INFINITY)?;
    x.broadcast_div(&norm).map_err(Into::into)
}

/// Attention with cosine-similarity scores (no `√d` scaling).
///
/// `q`, `k`, `v`: `[B, H, S, D]`; `mask` additive, `[q, k]` or rank 4.
pub fn cosine_attention(q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    let q = l2_normalize(q)?;
    let k = l2_normalize(k)?;
    let scores = q.matmul(&k.t()?)?;
    let scores = match mask {
        Some(mask) => scores.broadcast_add(&as_4d(mask)?.to_dtype(scores.dtype())?)?,
        None => scores,
    };
    let weights = candle_nn::ops::softmax_last_dim(&scores)?;
    weights.matmul(&v.contiguous()?).map_err(Into::into)
}

/// Dot-product scores blended with a Gaussian kernel on `‖q - k‖²`.
///
/// `ratio <= 0` returns the plain dot scores; otherwise
/// `(1 - ratio)·q·kᵀ + ratio·exp(-‖q - k‖² / 2σ²)`.
pub fn rbf_scores(q: &Tensor, k: &Tensor, sigma: f64, ratio: f64) -> Result<Tensor> {
    let dot = q.matmul(&k.t()?)?;
    if ratio <= 0.0 {
        return Ok(dot);
    }
    let q_norm = q.sqr()?.sum_keepdim(D::Minus1)?;
    let k_norm = k.sqr()?.sum_keepdim(D::Minus1)?.t()?;
    let dist_sq = q_norm.broadcast_add(&k_norm)?.broadcast_sub(&(&dot * 2.0)?)?;
    let rbf = (dist_sq / (-2.0 * sigma * sigma))?.exp()?;
    ((dot * (1.0 - ratio))? + (rbf * ratio)?).map_err(Into::into)
}

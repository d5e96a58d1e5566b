//! Attention primitives and variants.
//!
//! - [`scaled_dot_product_attention`]: the shared softmax kernel
//! - [`MultiHeadAttention`]: standard projections, used for decoder self-
//!   and cross-attention and for auxiliary-feature attention in encoders
//! - [`iterative`]: iterative local refinement attention
//! - [`window`]: sliding-window wrapper around the iterative attention
//! - [`similarity`], [`curiosity`], [`one_shot`]: experimental scorers

pub mod curiosity;
pub mod iterative;
pub mod one_shot;
pub mod similarity;
pub mod window;

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::kv_cache::KvCache;
use super::mask::{as_4d, causal_mask};
use crate::{Error, Result};

pub use curiosity::CuriosityAttention;
pub use iterative::{IterationStats, IterativeAttention, LocalAttention};
pub use one_shot::OneShotBias;
pub use similarity::{cosine_attention, rbf_scores};
pub use window::{SlidingWindowAttention, WindowSpan, plan_windows};

/// `[B, S, H·D]` → `[B, H, S, D]`.
pub fn split_heads(x: &Tensor, heads: usize) -> Result<Tensor> {
    let (batch, seq_len, dims) = x.dims3()?;
    if heads == 0 || dims % heads != 0 {
        return Err(Error::UnsupportedShape(format!(
            "cannot split {dims} features into {heads} heads"
        )));
    }
    x.reshape((batch, seq_len, heads, dims / heads))?
        .transpose(1, 2)?
        .contiguous()
        .map_err(Into::into)
}

/// `[B, H, S, D]` → `[B, S, H·D]`.
pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq_len, head_dim) = x.dims4()?;
    x.transpose(1, 2)?
        .reshape((batch, seq_len, heads * head_dim))
        .map_err(Into::into)
}

/// Softmax attention over `[B, H, S, D]` tensors.
///
/// - `mask`: additive, `[q, k]` or `[B|1, H|1, q, k]`; takes precedence
///   over `causal`
/// - `causal`: hide future keys when no mask is given
/// - `temperature`: queries are scaled by `(1 / temperature)^0.5` when it
///   is positive and not 1
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    causal: bool,
    temperature: f64,
) -> Result<Tensor> {
    let (_, _, q_len, head_dim) = q.dims4()?;
    let (_, _, k_len, k_dim) = k.dims4()?;
    if k_dim != head_dim || v.dim(2)? != k_len {
        return Err(Error::UnsupportedShape(format!(
            "attention q {:?}, k {:?}, v {:?}",
            q.dims(),
            k.dims(),
            v.dims()
        )));
    }

    let q = if temperature > 0.0 && temperature != 1.0 {
        (q * (1.0 / temperature).sqrt())?
    } else {
        q.clone()
    };
    let scale = (head_dim as f64).sqrt();
    let scores = (q.contiguous()?.matmul(&k.t()?.contiguous()?)? / scale)?;

    let scores = match mask {
        Some(mask) => {
            let mask = as_4d(mask)?.to_dtype(scores.dtype())?;
            scores.broadcast_add(&mask)?
        }
        None if causal => {
            let mask = causal_mask(q_len, k_len, scores.dtype(), scores.device())?;
            scores.broadcast_add(&mask)?
        }
        None => scores,
    };

    let weights = candle_nn::ops::softmax_last_dim(&scores)?;
    weights.matmul(&v.contiguous()?).map_err(Into::into)
}

/// Multi-head attention with `q`/`v`/`o` biases and a bias-free `k`.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    q: candle_nn::Linear,
    k: candle_nn::Linear,
    v: candle_nn::Linear,
    o: candle_nn::Linear,
    head: usize,
}

impl MultiHeadAttention {
    pub fn load(vb: VarBuilder, dims: usize, head: usize) -> Result<Self> {
        crate::config::check_heads(dims, head)?;
        Ok(Self {
            q: candle_nn::linear(dims, dims, vb.pp("q"))?,
            k: candle_nn::linear_no_bias(dims, dims, vb.pp("k"))?,
            v: candle_nn::linear(dims, dims, vb.pp("v"))?,
            o: candle_nn::linear(dims, dims, vb.pp("o"))?,
            head,
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, S, dims]` queries
    /// - `xa`: `[B, S_kv, dims]` keys/values, `x` when `None`
    /// - `mask`: additive mask, see [`scaled_dot_product_attention`]
    pub fn forward(
        &self,
        x: &Tensor,
        xa: Option<&Tensor>,
        mask: Option<&Tensor>,
        causal: bool,
    ) -> Result<Tensor> {
        let source = xa.unwrap_or(x);
        let q = split_heads(&self.q.forward(x)?, self.head)?;
        let k = split_heads(&self.k.forward(source)?, self.head)?;
        let v = split_heads(&self.v.forward(source)?, self.head)?;
        let out = scaled_dot_product_attention(&q, &k, &v, mask, causal, 1.0)?;
        self.o.forward(&merge_heads(&out)?).map_err(Into::into)
    }

    /// Causal self-attention for positions `start_pos..start_pos + S`,
    /// reading earlier keys and values from `cache`.
    pub fn forward_cached(&self, x: &Tensor, cache: &mut KvCache, start_pos: usize) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        let q = split_heads(&self.q.forward(x)?, self.head)?;
        let k = split_heads(&self.k.forward(x)?, self.head)?;
        let v = split_heads(&self.v.forward(x)?, self.head)?;
        let (k, v) = cache.update(start_pos, &k, &v)?;
        let mask = causal_mask(seq_len, start_pos + seq_len, q.dtype(), q.device())?;
        let out = scaled_dot_product_attention(&q, &k, &v, Some(&mask), false, 1.0)?;
        self.o.forward(&merge_heads(&out)?).map_err(Into::into)
    }
}

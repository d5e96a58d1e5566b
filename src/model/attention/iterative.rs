//! Iterative local refinement attention.
//!
//! Queries are refined by repeatedly attending over the shared span and
//! adding the result back onto the query:
//!
//! ```text
//! q₀ = split(q(lna(x)))            k, v = split(k|v(lnb(xa ?? x)))
//! loop i < max_iterations:
//!     span  = min(|x|, |q|, |k|, |xa|)
//!     outᵢ  = local.out(sdpa(local.q(qᵢ[:span]), local.k(k[:span]), local.v(v[:span])))
//!     diff  = mean |outᵢ - outᵢ₋₁|
//!     stop if i > 0 and diff < threshold + s_factor · diff
//!     qᵢ₊₁  = qᵢ + outᵢ
//! y = o(merge(out_last))
//! ```
//!
//! `threshold` and `s_factor` are learned scalars read once per call.

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Init, LayerNorm, VarBuilder};

use super::{merge_heads, scaled_dot_product_attention, split_heads};
use crate::config::{AttentionConfig, check_heads};
use crate::model::mask::{as_4d, ensure_covers};
use crate::{Error, Result};

/// Per-head projections applied inside each refinement pass.
#[derive(Debug, Clone)]
pub struct LocalAttention {
    query: candle_nn::Linear,
    key: candle_nn::Linear,
    value: candle_nn::Linear,
    out: candle_nn::Linear,
}

impl LocalAttention {
    pub fn load(vb: VarBuilder, head_dim: usize) -> Result<Self> {
        Ok(Self {
            query: candle_nn::linear(head_dim, head_dim, vb.pp("query"))?,
            key: candle_nn::linear(head_dim, head_dim, vb.pp("key"))?,
            value: candle_nn::linear(head_dim, head_dim, vb.pp("value"))?,
            out: candle_nn::linear(head_dim, head_dim, vb.pp("out"))?,
        })
    }

    /// `q`, `k`, `v`: `[B, H, S, head_dim]` → `[B, H, S_q, head_dim]`.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        causal: bool,
    ) -> Result<Tensor> {
        let q = self.query.forward(q)?;
        let k = self.key.forward(k)?;
        let v = self.value.forward(v)?;
        let out = scaled_dot_product_attention(&q, &k, &v, mask, causal, 1.0)?;
        self.out.forward(&out).map_err(Into::into)
    }
}

/// What a call to [`IterativeAttention::forward_with_stats`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationStats {
    /// Refinement passes run, at most `max_iterations`.
    pub iterations: usize,
    /// Mean absolute change of the last pass, if any pass ran.
    pub last_diff: Option<f32>,
    /// Whether the loop stopped on the threshold rather than the cap.
    pub converged: bool,
}

#[derive(Debug, Clone)]
pub struct IterativeAttention {
    q: candle_nn::Linear,
    k: candle_nn::Linear,
    v: candle_nn::Linear,
    o: candle_nn::Linear,
    lna: LayerNorm,
    lnb: LayerNorm,
    local: LocalAttention,
    threshold: Tensor,
    s_factor: Tensor,
    dims: usize,
    head: usize,
    max_iterations: usize,
    causal: bool,
}

fn layer_norm_no_bias(dims: usize, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(dims, "weight", Init::Const(1.0))?;
    Ok(LayerNorm::new_no_bias(weight, 1e-5))
}

impl IterativeAttention {
    pub fn load(vb: VarBuilder, dims: usize, head: usize, config: &AttentionConfig) -> Result<Self> {
        check_heads(dims, head)?;
        if config.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be at least 1".into()));
        }
        let head_dim = dims / head;
        Ok(Self {
            q: candle_nn::linear(dims, dims, vb.pp("q"))?,
            k: candle_nn::linear_no_bias(dims, dims, vb.pp("k"))?,
            v: candle_nn::linear(dims, dims, vb.pp("v"))?,
            o: candle_nn::linear(dims, dims, vb.pp("o"))?,
            lna: layer_norm_no_bias(dims, vb.pp("lna"))?,
            lnb: layer_norm_no_bias(dims, vb.pp("lnb"))?,
            local: LocalAttention::load(vb.pp("attn_local"), head_dim)?,
            threshold: vb.get_with_hints((), "threshold", Init::Const(config.threshold))?,
            s_factor: vb.get_with_hints((), "s_factor", Init::Const(config.s_factor))?,
            dims,
            head,
            max_iterations: config.max_iterations,
            causal: config.causal,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Current values of the learned `(threshold, s_factor)`.
    pub fn thresholds(&self) -> Result<(f32, f32)> {
        let read = |t: &Tensor| -> Result<f32> { Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?) };
        Ok((read(&self.threshold)?, read(&self.s_factor)?))
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, S_q, dims]`
    /// - `xa`: optional `[B, S_kv, dims]` key/value source
    /// - `mask`: optional additive `[S_q, S_kv]` or `[B|1, H|1, S_q, S_kv]`
    ///
    /// Returns `[B, S_q, dims]`.
    pub fn forward(&self, x: &Tensor, xa: Option<&Tensor>, mask: Option<&Tensor>) -> Result<Tensor> {
        self.forward_with_stats(x, xa, mask).map(|(out, _)| out)
    }

    pub fn forward_with_stats(
        &self,
        x: &Tensor,
        xa: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, IterationStats)> {
        let (batch, x_len, dims) = x.dims3()?;
        if dims != self.dims {
            return Err(Error::shape("iterative attention input", x.dims()));
        }
        if let Some(xa) = xa {
            let (xa_batch, _, xa_dims) = xa.dims3()?;
            if xa_batch != batch || xa_dims != self.dims {
                return Err(Error::UnsupportedShape(format!(
                    "iterative attention: x {:?} and xa {:?} disagree",
                    x.dims(),
                    xa.dims()
                )));
            }
        }
        let mask = mask.map(as_4d).transpose()?;
        let source = xa.unwrap_or(x);
        if let Some(mask) = &mask {
            ensure_covers(mask, x_len, source.dim(1)?, "iterative attention")?;
        }

        if x_len == 0 || source.dim(1)? == 0 {
            let zeros = Tensor::zeros((batch, x_len, dims), x.dtype(), x.device())?;
            let stats = IterationStats {
                iterations: 0,
                last_diff: None,
                converged: false,
            };
            return Ok((self.o.forward(&zeros)?, stats));
        }
        let query = split_heads(&self.q.forward(&self.lna.forward(x)?)?, self.head)?;
        let normed = self.lnb.forward(source)?;
        let key = split_heads(&self.k.forward(&normed)?, self.head)?;
        let value = split_heads(&self.v.forward(&normed)?, self.head)?;

        let (threshold, s_factor) = self.thresholds()?;
        let q_len = query.dim(2)?;
        let k_len = key.dim(2)?;

        let mut q_current = query.clone();
        let mut previous = query.zeros_like()?;
        let mut attn_out = query.zeros_like()?;
        let mut stats = IterationStats {
            iterations: 0,
            last_diff: None,
            converged: false,
        };

        for iteration in 0..self.max_iterations {
            let mut eff_span = x_len.min(q_len).min(k_len);
            if let Some(xa) = xa {
                eff_span = eff_span.min(xa.dim(1)?);
            }
            if eff_span == 0 {
                break;
            }

            let q_iter = q_current.narrow(2, 0, eff_span)?;
            let k_iter = key.narrow(2, 0, eff_span)?;
            let v_iter = value.narrow(2, 0, eff_span)?;
            let iter_mask = match &mask {
                Some(m) => Some(m.narrow(D::Minus2, 0, eff_span)?.narrow(D::Minus1, 0, eff_span)?),
                None => None,
            };
            let causal = self.causal && iter_mask.is_none();
            let span_out = self
                .local
                .forward(&q_iter, &k_iter, &v_iter, iter_mask.as_ref(), causal)?;
            let current = span_out.pad_with_zeros(2, 0, q_len - eff_span)?;

            let diff = (&current - &previous)?
                .abs()?
                .mean_all()?
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()?;
            let dynamic = threshold + s_factor * diff;
            stats.iterations = iteration + 1;
            stats.last_diff = Some(diff);
            tracing::trace!(iteration, diff, dynamic, eff_span, "refinement pass");

            if iteration > 0 && diff < dynamic {
                attn_out = current;
                stats.converged = true;
                break;
            }

            q_current = (q_current + &current)?;
            previous = current.clone();
            attn_out = current;
        }

        tracing::debug!(
            iterations = stats.iterations,
            converged = stats.converged,
            "iterative attention"
        );
        let out = self.o.forward(&merge_heads(&attn_out)?)?;
        Ok((out, stats))
    }
}

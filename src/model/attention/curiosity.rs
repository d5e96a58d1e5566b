//! Dual-pathway attention with a learned per-head gate.
//!
//! Main queries attend over `x` and, separately, over an auxiliary
//! sequence `xa`. A per-head gate `g = sigmoid(θ)` (θ starts at 0, so
//! g = 0.5) mixes the two: `out = main·(1 - g) + aux·g`.

use candle_core::{D, Module, Tensor};
use candle_nn::{Init, VarBuilder};

use super::{merge_heads, split_heads};
use crate::config::check_heads;
use crate::model::mask::{as_4d, min_value};
use crate::Result;

const MASK_FILL: f64 = -9e15;

#[derive(Debug, Clone)]
pub struct CuriosityAttention {
    qkv: candle_nn::Linear,
    qkv_aux: candle_nn::Linear,
    o: candle_nn::Linear,
    g: Tensor,
    head: usize,
    head_dim: usize,
}

impl CuriosityAttention {
    pub fn load(vb: VarBuilder, dims: usize, head: usize, bias: bool) -> Result<Self> {
        check_heads(dims, head)?;
        let linear = |i, o, vb| -> Result<candle_nn::Linear> {
            Ok(if bias {
                candle_nn::linear(i, o, vb)?
            } else {
                candle_nn::linear_no_bias(i, o, vb)?
            })
        };
        Ok(Self {
            qkv: linear(dims, dims * 3, vb.pp("qkv"))?,
            qkv_aux: linear(dims, dims * 3, vb.pp("qkv_aux"))?,
            o: linear(dims, dims, vb.pp("o"))?,
            g: vb.get_with_hints(head, "g", Init::Const(0.0))?,
            head,
            head_dim: dims / head,
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, S, dims]`, `xa`: `[B, S_aux, dims]`
    /// - `mask`: optional 1/0 `[S, S]` or `[B|1, H|1, S, S]`; positions
    ///   marked 1 are hidden from the main pathway
    pub fn forward(&self, x: &Tensor, xa: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let main = self.qkv.forward(x)?.chunk(3, D::Minus1)?;
        let aux = self.qkv_aux.forward(xa)?.chunk(3, D::Minus1)?;
        let (q, k, v) = (
            split_heads(&main[0], self.head)?,
            split_heads(&main[1], self.head)?,
            split_heads(&main[2], self.head)?,
        );
        let (ka, va) = (split_heads(&aux[1], self.head)?, split_heads(&aux[2], self.head)?);

        let scale = (self.head_dim as f64).sqrt();
        let dots = (q.matmul(&k.t()?)? / scale)?;
        let dots_aux = (q.matmul(&ka.t()?)? / scale)?;

        let dots = match mask {
            Some(mask) => {
                let hidden = as_4d(mask)?.ne(0.0)?.broadcast_as(dots.shape())?;
                let fill = MASK_FILL.max(min_value(dots.dtype()));
                let fill = (dots.ones_like()? * fill)?;
                hidden.where_cond(&fill, &dots)?
            }
            None => dots,
        };

        let h_main = candle_nn::ops::softmax_last_dim(&dots)?.matmul(&v)?;
        let h_aux = candle_nn::ops::softmax_last_dim(&dots_aux)?.matmul(&va)?;

        let gate = candle_nn::ops::sigmoid(&self.g)?.reshape((1, self.head, 1, 1))?;
        let mixed = (h_main.broadcast_mul(&gate.affine(-1.0, 1.0)?)? + h_aux.broadcast_mul(&gate)?)?;
        self.o.forward(&merge_heads(&mixed)?).map_err(Into::into)
    }
}

//! Sliding-window iterative attention.
//!
//! The sequence is cut into consecutive query windows of `win_size`; each
//! window attends over the `span_len` positions ending at its last query.
//! Window outputs are concatenated back in order.

use candle_core::{D, Tensor};
use candle_nn::VarBuilder;

use super::iterative::IterativeAttention;
use crate::config::{AttentionConfig, SlidingWindow, check_window};
use crate::model::mask::{as_4d, ensure_covers};
use crate::Result;

/// One query window and the key span it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpan {
    pub q_start: usize,
    pub q_end: usize,
    pub kv_start: usize,
    pub kv_end: usize,
}

impl WindowSpan {
    pub fn q_len(&self) -> usize {
        self.q_end - self.q_start
    }

    pub fn kv_len(&self) -> usize {
        self.kv_end - self.kv_start
    }
}

/// Windows covering `0..ctx`; the last one may be shorter than `win_size`.
pub fn plan_windows(ctx: usize, win_size: usize, span_len: usize) -> Result<Vec<WindowSpan>> {
    check_window(SlidingWindow { win_size, span_len })?;
    Ok((0..ctx.div_ceil(win_size))
        .map(|i| {
            let q_start = i * win_size;
            let q_end = (q_start + win_size).min(ctx);
            WindowSpan {
                q_start,
                q_end,
                kv_start: q_end.saturating_sub(span_len),
                kv_end: q_end,
            }
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct SlidingWindowAttention {
    attn: IterativeAttention,
    window: SlidingWindow,
}

impl SlidingWindowAttention {
    pub fn new(attn: IterativeAttention, window: SlidingWindow) -> Result<Self> {
        check_window(window)?;
        Ok(Self { attn, window })
    }

    pub fn load(
        vb: VarBuilder,
        dims: usize,
        head: usize,
        config: &AttentionConfig,
        window: SlidingWindow,
    ) -> Result<Self> {
        Self::new(IterativeAttention::load(vb, dims, head, config)?, window)
    }

    pub fn inner(&self) -> &IterativeAttention {
        &self.attn
    }

    pub fn window(&self) -> SlidingWindow {
        self.window
    }

    /// `x`: `[B, S, dims]`; `mask`: optional additive `[S, S]` or
    /// `[B|1, H|1, S, S]`. Returns `[B, S, dims]`.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let ctx = x.dim(1)?;
        let mask = mask.map(as_4d).transpose()?;
        if let Some(mask) = &mask {
            ensure_covers(mask, ctx, ctx, "sliding window attention")?;
        }
        let windows = plan_windows(ctx, self.window.win_size, self.window.span_len)?;
        if windows.is_empty() {
            return Ok(x.zeros_like()?);
        }

        let mut outputs = Vec::with_capacity(windows.len());
        for span in &windows {
            let query = x.narrow(1, span.q_start, span.q_len())?;
            let keys = x.narrow(1, span.kv_start, span.kv_len())?;
            let window_mask = match &mask {
                Some(m) => Some(
                    m.narrow(D::Minus2, span.q_start, span.q_len())?
                        .narrow(D::Minus1, span.kv_start, span.kv_len())?,
                ),
                None => None,
            };
            outputs.push(self.attn.forward(&query, Some(&keys), window_mask.as_ref())?);
        }
        tracing::debug!(windows = windows.len(), ctx, "sliding window attention");
        Tensor::cat(&outputs, 1).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_windows_cover_every_position_once() {
        for (ctx, win, span) in [(10, 3, 5), (8, 4, 4), (1, 512, 1024), (7, 7, 2)] {
            let windows = plan_windows(ctx, win, span).unwrap();
            let mut covered = vec![0; ctx];
            for w in &windows {
                assert!(w.q_len() <= win);
                assert_eq!(w.kv_end, w.q_end);
                assert!(w.kv_len() <= span);
                for pos in w.q_start..w.q_end {
                    covered[pos] += 1;
                }
            }
            assert!(covered.iter().all(|&c| c == 1), "ctx {ctx}: {covered:?}");
        }
    }

    #[test]
    fn test_last_window_is_short() {
        let windows = plan_windows(10, 4, 6).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(
            windows[2],
            WindowSpan {
                q_start: 8,
                q_end: 10,
                kv_start: 4,
                kv_end: 10
            }
        );
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(matches!(plan_windows(10, 0, 4), Err(crate::Error::Config(_))));
        assert!(plan_windows(10, 4, 0).is_err());
    }

    #[test]
    fn test_forward_stitches_full_length() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let window = SlidingWindow {
            win_size: 4,
            span_len: 6,
        };
        let attn = SlidingWindowAttention::load(vb, 16, 2, &AttentionConfig::default(), window).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 11, 16), &device).unwrap();
        let mask = Tensor::zeros((11, 11), DType::F32, &device).unwrap();
        let out = attn.forward(&x, Some(&mask)).unwrap();
        assert_eq!(out.dims(), &[2, 11, 16]);
        let out = attn.forward(&x, None).unwrap();
        assert_eq!(out.dims(), &[2, 11, 16]);
    }

    #[test]
    fn test_short_mask_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let window = SlidingWindow {
            win_size: 4,
            span_len: 6,
        };
        let attn = SlidingWindowAttention::load(vb, 16, 2, &AttentionConfig::default(), window).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 11, 16), &device).unwrap();
        let mask = Tensor::zeros((8, 8), DType::F32, &device).unwrap();
        assert!(matches!(
            attn.forward(&x, Some(&mask)),
            Err(crate::Error::UnsupportedShape(_))
        ));
    }
}

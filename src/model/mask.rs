//! Attention masks.
//!
//! Attention consumes additive masks: `0.0` for visible positions and the
//! dtype minimum for hidden ones. The 1/0 helpers ([`sliding_window_mask`],
//! [`mask_win`]) mark visible positions with 1 and convert through
//! [`to_additive`].

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Most negative finite value of `dtype`, used for hidden positions.
pub fn min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

fn additive_from_fn(
    rows: usize,
    cols: usize,
    dtype: DType,
    device: &Device,
    visible: impl Fn(usize, usize) -> bool,
) -> Result<Tensor> {
    let min_val = min_value(dtype);
    let mut mask_data = vec![0.0f64; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            if !visible(i, j) {
                mask_data[i * cols + j] = min_val;
            }
        }
    }
    Tensor::from_vec(mask_data, (rows, cols), device)?
        .to_dtype(dtype)
        .map_err(Into::into)
}

/// Additive causal mask `[q_len, k_len]`.
///
/// When `k_len > q_len` the queries are the last `q_len` positions (the
/// cached-decoding case), so query `i` sees keys `0..=i + k_len - q_len`.
pub fn causal_mask(q_len: usize, k_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    additive_from_fn(q_len, k_len, dtype, device, |i, j| j <= i + offset)
}

/// Additive `[batch, 1, ctx, ctx]` mask from causality and key padding.
///
/// `padding` is `[batch, ctx]` with 1 for real tokens and 0 for padding.
pub fn create_attention_mask(
    batch: usize,
    ctx: usize,
    causal: bool,
    padding: Option<&Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let base = if causal {
        causal_mask(ctx, ctx, dtype, device)?
    } else {
        Tensor::zeros((ctx, ctx), dtype, device)?
    };
    let base = base.reshape((1, 1, ctx, ctx))?;
    let mask = match padding {
        Some(padding) => {
            let (pad_batch, pad_ctx) = padding.dims2()?;
            if pad_batch != batch || pad_ctx != ctx {
                return Err(Error::shape("create_attention_mask padding", padding.dims()));
            }
            let keys = to_additive(padding, dtype)?.reshape((batch, 1, 1, ctx))?;
            // Clamp keeps min + min from overflowing to -inf.
            base.broadcast_add(&keys)?
                .clamp(min_value(dtype), 0.0)?
        }
        None => base.repeat((batch, 1, 1, 1))?,
    };
    Ok(mask)
}

/// 1/0 band mask `[q_len, k_len]`: `mask[i, j] = 1` iff `i - window < j <= i`.
pub fn sliding_window_mask(q_len: usize, k_len: usize, window: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; q_len * k_len];
    for i in 0..q_len {
        for j in 0..k_len {
            if j + window > i && j <= i {
                data[i * k_len + j] = 1.0;
            }
        }
    }
    Tensor::from_vec(data, (q_len, k_len), device).map_err(Into::into)
}

/// 1/0 mask `[text_ctx, aud_ctx]` of a causal text block followed by a
/// lower-triangular text-to-audio block.
pub fn mask_win(text_ctx: usize, aud_ctx: usize, device: &Device) -> Result<Tensor> {
    if aud_ctx < text_ctx {
        return Err(Error::UnsupportedShape(format!(
            "mask_win: audio context {aud_ctx} shorter than text context {text_ctx}"
        )));
    }
    let text = Tensor::tril2(text_ctx, DType::F32, device)?;
    let audio_cols = aud_ctx - text_ctx;
    let mut audio = vec![0f32; text_ctx * audio_cols];
    for i in 0..text_ctx {
        for j in 0..audio_cols.min(i + 1) {
            audio[i * audio_cols + j] = 1.0;
        }
    }
    let audio = Tensor::from_vec(audio, (text_ctx, audio_cols), device)?;
    Tensor::cat(&[&text, &audio], 1).map_err(Into::into)
}

/// Convert a 1/0 visibility mask into an additive mask of `dtype`.
pub fn to_additive(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let compute = if dtype == DType::F64 { DType::F64 } else { DType::F32 };
    let hidden = mask.to_dtype(compute)?.affine(-1.0, 1.0)?;
    (hidden * min_value(dtype))?.to_dtype(dtype).map_err(Into::into)
}

/// Bring a rank-2 `[q, k]` or rank-4 `[B|1, H|1, q, k]` mask to rank 4.
pub fn as_4d(mask: &Tensor) -> Result<Tensor> {
    match mask.rank() {
        2 => mask.unsqueeze(0)?.unsqueeze(0).map_err(Into::into),
        4 => Ok(mask.clone()),
        _ => Err(Error::shape("attention mask", mask.dims())),
    }
}

/// Fails with `UnsupportedShape` unless the 4-D `mask` spans at least
/// `q_len` rows and `k_len` columns.
pub fn ensure_covers(mask: &Tensor, q_len: usize, k_len: usize, op: &str) -> Result<()> {
    let (_, _, rows, cols) = mask.dims4()?;
    if rows < q_len || cols < k_len {
        return Err(Error::UnsupportedShape(format!(
            "{op}: mask {:?} does not cover {q_len}x{k_len}",
            mask.dims()
        )));
    }
    Ok(())
}

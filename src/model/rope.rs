//! Rotary position embedding (RoPE).
//!
//! Two frequency layouts share the rotate-half application:
//! - [`FrequencySpacing::Inverse`]: `θ^(-2i/head_dim)`, the LLaMA layout
//! - [`FrequencySpacing::Mel`]: frequencies spaced evenly on the mel scale
//!   up to 8 kHz and scaled by `θ / 220`, so a pitch offset on θ moves the
//!   whole band
//!
//! With an F0 track, each position uses `θ + f0[t]` instead of a fixed θ.

use candle_core::{D, DType, Device, Tensor};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencySpacing {
    Inverse,
    Mel,
}

/// Pre-computed rotary embedding tables.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    head_dim: usize,
    theta: f64,
    spacing: FrequencySpacing,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64) -> Self {
        Self {
            head_dim,
            theta,
            spacing: FrequencySpacing::Inverse,
        }
    }

    /// Mel-spaced frequencies.
    pub fn mel(head_dim: usize, theta: f64) -> Self {
        Self {
            head_dim,
            theta,
            spacing: FrequencySpacing::Mel,
        }
    }

    pub fn spacing(&self) -> FrequencySpacing {
        self.spacing
    }

    /// Per-pair frequencies for a given θ, `head_dim / 2` values.
    pub fn frequencies(&self, theta: f64) -> Vec<f64> {
        let half_dim = self.head_dim / 2;
        match self.spacing {
            // inv_freq = 1 / (theta ^ (2i / head_dim))
            FrequencySpacing::Inverse => (0..half_dim)
                .map(|i| 1.0 / theta.powf(2.0 * i as f64 / self.head_dim as f64))
                .collect(),
            FrequencySpacing::Mel => mel_band(half_dim)
                .into_iter()
                .map(|hz| theta / 220.0 * hz / 1000.0)
                .collect(),
        }
    }

    /// Compute cos and sin tables for positions `0..seq_len`.
    ///
    /// Returns `(cos, sin)` each of shape `[seq_len, head_dim]`.
    pub fn compute_freqs(
        &self,
        seq_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let half_dim = self.head_dim / 2;
        let inv_freq = self.frequencies(self.theta);
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions: Vec<f64> = (0..seq_len).map(|i| i as f64).collect();
        let positions = Tensor::from_vec(positions, (seq_len, 1), device)?;

        // freqs = outer(positions, inv_freq) → [seq_len, half_dim]
        let freqs = positions.matmul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }

    /// Pitch-conditioned tables: position `t` of row `b` uses `θ + f0[b, t]`.
    ///
    /// `f0` is `[S]` or `[B, S]`; returns `(cos, sin)` of shape `[S, D]` or
    /// `[B, S, D]`.
    pub fn compute_freqs_with_f0(&self, f0: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let device = f0.device();
        let half_dim = self.head_dim / 2;
        let seq_len = f0.dim(D::Minus1)?;
        if f0.rank() > 2 {
            return Err(Error::shape("rope f0 track", f0.dims()));
        }

        let theta = (f0.to_dtype(DType::F32)? + self.theta)?.unsqueeze(D::Minus1)?;
        let positions = Tensor::arange(0u32, seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .unsqueeze(1)?;

        let per_position = match self.spacing {
            FrequencySpacing::Mel => {
                let band: Vec<f32> = mel_band(half_dim)
                    .into_iter()
                    .map(|hz| (hz / 220.0 / 1000.0) as f32)
                    .collect();
                let band = Tensor::from_vec(band, half_dim, device)?;
                theta.broadcast_mul(&band)?
            }
            FrequencySpacing::Inverse => {
                let exponents: Vec<f32> = (0..half_dim)
                    .map(|i| -(2.0 * i as f32) / self.head_dim as f32)
                    .collect();
                let exponents = Tensor::from_vec(exponents, half_dim, device)?;
                theta.log()?.broadcast_mul(&exponents)?.exp()?
            }
        };
        let freqs = per_position.broadcast_mul(&positions)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }

    /// Apply rotary embedding to a tensor `x` of shape `[B, H, S, D]`.
    ///
    /// `cos` and `sin` have shape `[S, D]` or, per batch row, `[B, S, D]`.
    pub fn apply(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();

        // Rotate in f32 regardless of the model dtype.
        let x = x.to_dtype(DType::F32)?;
        let (cos, sin) = match cos.rank() {
            2 => (cos.unsqueeze(0)?.unsqueeze(0)?, sin.unsqueeze(0)?.unsqueeze(0)?),
            3 => (cos.unsqueeze(1)?, sin.unsqueeze(1)?),
            _ => return Err(Error::shape("rope table", cos.dims())),
        };
        let cos = cos.to_dtype(DType::F32)?;
        let sin = sin.to_dtype(DType::F32)?;

        // rotate_half: [-x[..., D/2:], x[..., :D/2]]
        let half = x.dim(D::Minus1)? / 2;
        let x_first = x.narrow(D::Minus1, 0, half)?;
        let x_second = x.narrow(D::Minus1, half, half)?;
        let x_rotated = Tensor::cat(&[&x_second.neg()?, &x_first], D::Minus1)?;

        let result = (x.broadcast_mul(&cos)? + x_rotated.broadcast_mul(&sin)?)?;
        result.to_dtype(x_dtype).map_err(Into::into)
    }
}

/// `n` frequencies (Hz) evenly spaced on the mel scale from 0 to 8 kHz.
fn mel_band(n: usize) -> Vec<f64> {
    let top = 2595.0 * (1.0 + 8000.0 / 700.0f64).log10();
    (0..n)
        .map(|i| {
            let mel = if n > 1 { top * i as f64 / (n - 1) as f64 } else { 0.0 };
            700.0 * (10f64.powf(mel / 2595.0) - 1.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freqs_shape() {
        let rope = RotaryEmbedding::new(64, 10_000.0);
        let (cos, sin) = rope.compute_freqs(128, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(cos.dims(), &[128, 64]);
        assert_eq!(sin.dims(), &[128, 64]);
    }

    #[test]
    fn test_mel_band_spans_to_8khz() {
        let band = mel_band(5);
        assert_eq!(band[0], 0.0);
        assert!((band[4] - 8000.0).abs() < 1e-6);
        assert!(band.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_apply_preserves_norm_approximately() {
        let device = Device::Cpu;
        for rope in [RotaryEmbedding::new(32, 10_000.0), RotaryEmbedding::mel(32, 10_000.0)] {
            let x = Tensor::randn(0.0_f32, 1.0, (1, 4, 16, 32), &device).unwrap();
            let (cos, sin) = rope.compute_freqs(16, DType::F32, &device).unwrap();
            let result = RotaryEmbedding::apply(&x, &cos, &sin).unwrap();
            assert_eq!(result.dims(), x.dims());

            let x_norm: f32 = x.sqr().unwrap().mean_all().unwrap().to_scalar().unwrap();
            let r_norm: f32 = result.sqr().unwrap().mean_all().unwrap().to_scalar().unwrap();
            assert!((x_norm - r_norm).abs() < 0.01, "{x_norm} vs {r_norm}");
        }
    }

    #[test]
    fn test_zero_f0_matches_fixed_theta() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::mel(16, 10_000.0);
        let (cos, sin) = rope.compute_freqs(10, DType::F32, &device).unwrap();
        let f0 = Tensor::zeros(10, DType::F32, &device).unwrap();
        let (cos_f0, sin_f0) = rope.compute_freqs_with_f0(&f0, DType::F32).unwrap();
        let diff: f32 = (cos - cos_f0).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-3, "cos diff {diff}");
        let diff: f32 = (sin - sin_f0).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-3, "sin diff {diff}");
    }

    #[test]
    fn test_batched_f0_tables_apply() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 10_000.0);
        let f0 = Tensor::new(&[[100f32, 110., 120.], [0., 0., 0.]], &device).unwrap();
        let (cos, sin) = rope.compute_freqs_with_f0(&f0, DType::F32).unwrap();
        assert_eq!(cos.dims(), &[2, 3, 8]);
        let x = Tensor::randn(0.0_f32, 1.0, (2, 2, 3, 8), &device).unwrap();
        let out = RotaryEmbedding::apply(&x, &cos, &sin).unwrap();
        assert_eq!(out.dims(), &[2, 2, 3, 8]);
    }
}

//! One-shot additive attention bias between two sequences.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::split_heads;
use crate::config::check_heads;
use crate::features::FeatureKind;
use crate::Result;

/// Produces `(q(x)·k(xa)ᵀ)·scale/√head_dim`, shaped `[B, H, S, S_aux]`, to
/// add onto another attention's scores.
#[derive(Debug, Clone)]
pub struct OneShotBias {
    q: candle_nn::Linear,
    k: candle_nn::Linear,
    head: usize,
    head_dim: usize,
    scale: f64,
}

impl OneShotBias {
    pub const DEFAULT_SCALE: f64 = 0.3;

    /// With a non-empty `features` list the bias is split evenly across
    /// them (`scale = 1 / len`); otherwise `scale` is used as given.
    pub fn load(
        vb: VarBuilder,
        dims: usize,
        head: usize,
        scale: f64,
        features: Option<&[FeatureKind]>,
    ) -> Result<Self> {
        check_heads(dims, head)?;
        let scale = match features {
            Some(features) if !features.is_empty() => 1.0 / features.len() as f64,
            _ => scale,
        };
        Ok(Self {
            q: candle_nn::linear(dims, dims, vb.pp("q"))?,
            k: candle_nn::linear(dims, dims, vb.pp("k"))?,
            head,
            head_dim: dims / head,
            scale,
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn forward(&self, x: &Tensor, xa: &Tensor) -> Result<Tensor> {
        let q = split_heads(&self.q.forward(x)?, self.head)?;
        let k = split_heads(&self.k.forward(xa)?, self.head)?;
        let bias = q.matmul(&k.t()?)?;
        (bias * (self.scale / (self.head_dim as f64).sqrt())).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn test_scale_follows_feature_count() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let features = [FeatureKind::Spectrogram, FeatureKind::Pitch, FeatureKind::F0, FeatureKind::Waveform];
        let bias = OneShotBias::load(vb.pp("a"), 16, 2, 0.3, Some(&features)).unwrap();
        assert!((bias.scale() - 0.25).abs() < 1e-12);

        let bias = OneShotBias::load(vb.pp("b"), 16, 2, 0.3, Some(&[])).unwrap();
        assert!((bias.scale() - 0.3).abs() < 1e-12);
        let bias = OneShotBias::load(vb.pp("c"), 16, 2, OneShotBias::DEFAULT_SCALE, None).unwrap();
        assert!((bias.scale() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_bias_shape() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let bias = OneShotBias::load(vb, 16, 4, 0.3, None).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 16), &device).unwrap();
        let xa = Tensor::randn(0f32, 1.0, (2, 7, 16), &device).unwrap();
        assert_eq!(bias.forward(&x, &xa).unwrap().dims(), &[2, 4, 3, 7]);
    }
}

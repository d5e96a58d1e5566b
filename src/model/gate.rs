//! Type-conditioned gating.

use candle_core::{D, Module, Tensor};
use candle_nn::VarBuilder;

use crate::Result;

/// `num_types` sigmoid gates mixed by a softmax type classifier.
///
/// `gate(x) = Σₜ softmax(classifier(x))ₜ · sigmoid(gateₜ(x))`, one value
/// per position.
#[derive(Debug, Clone)]
pub struct TypeGate {
    gates: Vec<candle_nn::Linear>,
    classifier: candle_nn::Linear,
}

impl TypeGate {
    pub fn load(vb: VarBuilder, dims: usize, num_types: usize) -> Result<Self> {
        let gates = (0..num_types)
            .map(|i| candle_nn::linear(dims, 1, vb.pp(format!("gates.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let classifier = candle_nn::linear(dims, num_types, vb.pp("classifier"))?;
        Ok(Self { gates, classifier })
    }

    /// `x`: `[B, S, dims]` → `[B, S, 1]` in `(0, 1)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let types = candle_nn::ops::softmax_last_dim(&self.classifier.forward(x)?)?;
        let gates = self
            .gates
            .iter()
            .map(|gate| candle_nn::ops::sigmoid(&gate.forward(x)?))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let gates = Tensor::stack(&gates, D::Minus1)?;
        gates
            .broadcast_mul(&types.unsqueeze(2)?)?
            .sum(D::Minus1)
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_gate_is_a_probability_per_position() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gate = TypeGate::load(vb, 8, 4).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &device).unwrap();
        let out = gate.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 5, 1]);
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| v > 0.0 && v < 1.0));
    }
}

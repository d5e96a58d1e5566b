//! Activation functions selectable by name.

use candle_core::{Module, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Gelu,
    Relu,
    Sigmoid,
    Tanh,
    Swish,
    Tanhshrink,
    Softplus,
    Softshrink,
    LeakyRelu,
    Elu,
}

impl Activation {
    /// Look up an activation by name.
    ///
    /// Unknown names fall back to GELU with a warning.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "gelu" => Activation::Gelu,
            "relu" => Activation::Relu,
            "sigmoid" => Activation::Sigmoid,
            "tanh" => Activation::Tanh,
            "swish" | "silu" => Activation::Swish,
            "tanhshrink" => Activation::Tanhshrink,
            "softplus" => Activation::Softplus,
            "softshrink" => Activation::Softshrink,
            "leaky_relu" => Activation::LeakyRelu,
            "elu" => Activation::Elu,
            other => {
                tracing::warn!("unknown activation '{other}', using gelu");
                Activation::Gelu
            }
        }
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Gelu => xs.gelu_erf(),
            Activation::Relu => xs.relu(),
            Activation::Sigmoid => candle_nn::ops::sigmoid(xs),
            Activation::Tanh => xs.tanh(),
            Activation::Swish => xs.silu(),
            Activation::Tanhshrink => xs - xs.tanh()?,
            // relu(x) + log(1 + exp(-|x|)) stays finite for large |x|.
            Activation::Softplus => xs.relu()? + (xs.abs()?.neg()?.exp()? + 1.0)?.log()?,
            Activation::Softshrink => xs - xs.clamp(-0.5, 0.5)?,
            Activation::LeakyRelu => candle_nn::ops::leaky_relu(xs, 0.01),
            Activation::Elu => xs.elu(1.0),
        }
    }
}

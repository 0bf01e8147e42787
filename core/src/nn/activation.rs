//! Activation Functions.
//!
//! Activation functions introduce **non-linearity** into neural networks. ConvLSTM cells apply one
//! to the candidate cell update and to the cell state before the output gate.
//!
//! - **ReLU**: $f(x) = \max(0, x)$.
//! - **Tanh**: the classic LSTM choice, bounded in $(-1, 1)$.
//! - **Sigmoid**: $1 / (1 + e^{-x})$, bounded in $(0, 1)$.

use crate::autograd::Variable;
use crate::tensor::{FloatElem, TensorError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named activation, selectable from configuration (`"relu"`, `"tanh"`, `"sigmoid"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    /// Applies the activation element-wise, recording it on the graph.
    pub fn apply<T: FloatElem, const RANK: usize>(self, x: &Variable<T, RANK>) -> Variable<T, RANK> {
        match self {
            Activation::Relu => x.relu(),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => x.sigmoid(),
        }
    }
}

impl FromStr for Activation {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            other => Err(TensorError::Unsupported(format!("unknown activation '{other}'"))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
        };
        f.write_str(name)
    }
}

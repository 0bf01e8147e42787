//! Regression losses between predicted and target frames.

use crate::autograd::Variable;
use crate::tensor::{FloatElem, Result, TensorError};
use serde::{Deserialize, Serialize};

/// Mean squared error: `mean((prediction - target)^2)`.
///
/// # Errors
///
/// Returns `TensorError::ShapeMismatch` when the shapes differ. Nothing is broadcast, so a
/// single predicted frame is not silently compared against a whole target sequence.
pub fn mse_loss<T: FloatElem, const RANK: usize>(
    prediction: &Variable<T, RANK>,
    target: &Variable<T, RANK>,
) -> Result<Variable<T, 0>> {
    let diff = (prediction - target)?;
    (&diff * &diff)?.mean()
}

/// Mean absolute error: `mean(|prediction - target|)`.
pub fn l1_loss<T: FloatElem, const RANK: usize>(
    prediction: &Variable<T, RANK>,
    target: &Variable<T, RANK>,
) -> Result<Variable<T, 0>> {
    (prediction - target)?.abs().mean()
}

/// A loss selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    Mse,
    L1,
}

impl LossKind {
    pub fn compute<T: FloatElem, const RANK: usize>(
        self,
        prediction: &Variable<T, RANK>,
        target: &Variable<T, RANK>,
    ) -> Result<Variable<T, 0>> {
        match self {
            LossKind::Mse => mse_loss(prediction, target),
            LossKind::L1 => l1_loss(prediction, target),
        }
    }

    /// Scalar value of the loss, for metrics.
    pub fn value<T: FloatElem, const RANK: usize>(
        self,
        prediction: &Variable<T, RANK>,
        target: &Variable<T, RANK>,
    ) -> Result<f64> {
        let loss = self.compute(prediction, target)?;
        loss.data.data()[0]
            .to_f64()
            .ok_or_else(|| TensorError::Unsupported("loss is not representable as f64".into()))
    }
}

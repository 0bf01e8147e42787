pub mod adamw;
pub mod sgd;

pub use adamw::AdamW;
pub use sgd::Sgd;

use crate::nn::Module;
use crate::tensor::{FloatElem, Result, Tensor, TensorElem, TensorError};
use serde::{Deserialize, Serialize};

/// Applies accumulated gradients to a model's parameters.
///
/// Parameters are updated as flat slices whatever their rank; optimizer state is keyed by the
/// dotted parameter name, so it survives across steps as long as the model keeps its layout.
pub trait Optimizer<T: TensorElem> {
    /// Updates one flattened parameter in place.
    ///
    /// # Errors
    ///
    /// Returns an error if `param` and `grad` have different lengths.
    fn update_slice(&mut self, key: &str, param: &mut [T], grad: &[T]) -> Result<()>;

    fn learning_rate(&self) -> T;

    /// [`update_slice`](Self::update_slice) for a tensor, checking the full shape first.
    fn update<const RANK: usize>(
        &mut self,
        key: &str,
        param: &mut Tensor<T, RANK>,
        grad: &Tensor<T, RANK>,
    ) -> Result<()>
    where
        Self: Sized,
    {
        if param.shape() != grad.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: param.shape().to_vec(),
                got: grad.shape().to_vec(),
            });
        }
        self.update_slice(key, param.data_mut(), grad.data())
    }

    /// One step over every parameter of `model` that holds a gradient; the rest are skipped.
    fn step(&mut self, model: &mut dyn Module<T>) -> Result<()> {
        let mut result = Ok(());
        model.visit_parameters("", &mut |name, param| {
            if result.is_err() {
                return;
            }
            if let Some(grad) = param.grad() {
                result = self.update_slice(name, param.values_mut(), &grad);
            }
        });
        result
    }
}

pub(crate) fn check_lengths<T>(param: &[T], grad: &[T]) -> Result<()> {
    if param.len() != grad.len() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![param.len()],
            got: vec![grad.len()],
        });
    }
    Ok(())
}

/// An optimizer selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum OptimizerKind {
    /// AdamW without weight decay.
    #[default]
    Adam,
    AdamW { weight_decay: f64 },
    Sgd,
}

impl OptimizerKind {
    pub fn build<T: FloatElem>(self, learning_rate: f64) -> Result<Box<dyn Optimizer<T>>> {
        let lr = cast::<T>(learning_rate)?;
        Ok(match self {
            OptimizerKind::Adam => Box::new(AdamW::adam(lr)),
            OptimizerKind::AdamW { weight_decay } => {
                Box::new(AdamW::new(lr).with_weight_decay(cast(weight_decay)?))
            }
            OptimizerKind::Sgd => Box::new(Sgd::new(lr)),
        })
    }
}

fn cast<T: FloatElem>(v: f64) -> Result<T> {
    T::from_f64(v).ok_or_else(|| TensorError::Unsupported(format!("{v} is not representable")))
}

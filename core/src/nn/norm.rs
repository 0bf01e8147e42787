use crate::autograd::Variable;
use crate::nn::module::{Module, Parameter, join};
use crate::tensor::{FloatElem, Result, Tensor, TensorElem};

/// Layer Normalization over a multi-dimensional trailing shape.
///
/// Each sample is normalized over its last `W` dims (e.g. `[C, T, H, W]` of a `[B, C, T, H, W]`
/// video) to zero mean and unit variance, then scaled and shifted elementwise.
#[derive(Debug)]
pub struct LayerNorm<T: TensorElem, const W: usize> {
    pub weight: Variable<T, W>,
    pub bias: Variable<T, W>,
    pub eps: T,
}

impl<T: FloatElem, const W: usize> LayerNorm<T, W> {
    /// Creates a LayerNorm with unit weight, zero bias and `eps = 1e-5`.
    pub fn new(normalized_shape: [usize; W]) -> Self {
        Self {
            weight: Variable::new(Tensor::ones(normalized_shape)),
            bias: Variable::new(Tensor::zeros(normalized_shape)),
            eps: T::from_f64(1e-5).unwrap_or_else(T::epsilon),
        }
    }

    pub fn normalized_shape(&self) -> &[usize; W] {
        self.weight.shape()
    }

    /// Performs the forward pass.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` when the trailing dims of `x` differ from the
    /// normalized shape.
    pub fn forward<const RANK: usize>(&self, x: &Variable<T, RANK>) -> Result<Variable<T, RANK>> {
        x.layer_norm(&self.weight, &self.bias, self.eps)
    }
}

impl<T: TensorElem + 'static, const W: usize> Module<T> for LayerNorm<T, W> {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut dyn Parameter<T>)) {
        f(&join(prefix, "weight"), &mut self.weight);
        f(&join(prefix, "bias"), &mut self.bias);
    }
}

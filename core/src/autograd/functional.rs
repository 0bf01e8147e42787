use crate::autograd::Variable;
use crate::tensor::{FloatElem, Result, Tensor, TensorElem};

/// Computes the value and gradient of a scalar function `f` with respect to its input.
///
/// Returns a function that takes a `Tensor` input and returns `(value, gradient)`. Inputs the
/// output does not depend on get a zero gradient.
pub fn value_and_grad<F, T, const RANK: usize>(
    f: F,
) -> impl Fn(Tensor<T, RANK>) -> Result<(T, Tensor<T, RANK>)>
where
    F: Fn(&Variable<T, RANK>) -> Result<Variable<T, 0>>,
    T: TensorElem + 'static,
{
    move |x| {
        let x_var = Variable::new(x);
        let y_var = f(&x_var)?;
        y_var.backward()?;

        let g = x_var
            .grad_tensor()
            .unwrap_or_else(|| Tensor::zeros(*x_var.shape()));
        Ok((y_var.data.data()[0], g))
    }
}

/// Computes the gradient of a scalar function `f` with respect to its input.
pub fn grad<F, T, const RANK: usize>(f: F) -> impl Fn(Tensor<T, RANK>) -> Result<Tensor<T, RANK>>
where
    F: Fn(&Variable<T, RANK>) -> Result<Variable<T, 0>>,
    T: TensorElem + 'static,
{
    let value_and_grad = value_and_grad(f);
    move |x| Ok(value_and_grad(x)?.1)
}

/// Central finite-difference gradient of a scalar function, one element at a time.
///
/// `(f(x + eps) - f(x - eps)) / (2 * eps)` per coordinate. Used to validate analytic gradients.
pub fn numerical_grad<F, T, const RANK: usize>(
    f: F,
    x: &Tensor<T, RANK>,
    eps: T,
) -> Result<Tensor<T, RANK>>
where
    F: Fn(&Tensor<T, RANK>) -> Result<T>,
    T: FloatElem,
{
    let mut probe = x.clone();
    let mut out = Vec::with_capacity(x.size());

    for i in 0..x.size() {
        let original = probe.data()[i];
        probe.data_mut()[i] = original + eps;
        let plus = f(&probe)?;
        probe.data_mut()[i] = original - eps;
        let minus = f(&probe)?;
        probe.data_mut()[i] = original;
        out.push((plus - minus) / (eps + eps));
    }

    Tensor::new(out, *x.shape())
}

//! Differentiable operations.
//!
//! Arithmetic and matmul nodes keep their operands explicitly; the single-input operations
//! (activations, reductions, layout changes) share [`UnaryNode`], which stores a closure mapping
//! the output gradient to the input gradient.

use super::{GradCell, GraphNode, Variable, accumulate, parents_of};
use crate::tensor::{FloatElem, Result, Tensor, TensorElem, TensorError};
use rayon::prelude::*;
use std::cell::RefCell;
use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

// --- Add Node ---
#[derive(Debug)]
struct AddNode<T: TensorElem, const RANK: usize> {
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for AddNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        if let Some(grad) = self.out_grad.borrow().as_ref() {
            // d(x+y)/dx = d(x+y)/dy = 1
            accumulate(&self.lhs_grad, grad.clone())?;
            accumulate(&self.rhs_grad, grad.clone())?;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Add for &Variable<T, RANK> {
    type Output = Result<Variable<T, RANK>>;

    fn add(self, rhs: Self) -> Self::Output {
        let data = (&self.data + &rhs.data)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(AddNode {
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

// --- Sub Node ---
#[derive(Debug)]
struct SubNode<T: TensorElem, const RANK: usize> {
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for SubNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        if let Some(grad) = self.out_grad.borrow().as_ref() {
            // d(x-y)/dx = 1, d(x-y)/dy = -1
            accumulate(&self.lhs_grad, grad.clone())?;
            let neg_grad = (&Tensor::zeros(*grad.shape()) - grad)?;
            accumulate(&self.rhs_grad, neg_grad)?;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Sub for &Variable<T, RANK> {
    type Output = Result<Variable<T, RANK>>;

    fn sub(self, rhs: Self) -> Self::Output {
        let data = (&self.data - &rhs.data)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(SubNode {
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

// --- Mul Node ---
#[derive(Debug)]
struct MulNode<T: TensorElem, const RANK: usize> {
    lhs_data: Tensor<T, RANK>,
    rhs_data: Tensor<T, RANK>,
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for MulNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        if let Some(grad) = self.out_grad.borrow().as_ref() {
            // d(x*y)/dx = y, d(x*y)/dy = x
            accumulate(&self.lhs_grad, (grad * &self.rhs_data)?)?;
            accumulate(&self.rhs_grad, (grad * &self.lhs_data)?)?;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Mul for &Variable<T, RANK> {
    type Output = Result<Variable<T, RANK>>;

    fn mul(self, rhs: Self) -> Self::Output {
        let data = (&self.data * &rhs.data)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(MulNode {
            lhs_data: self.data.clone(),
            rhs_data: rhs.data.clone(),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

// --- Div Node ---
#[derive(Debug)]
struct DivNode<T: TensorElem, const RANK: usize> {
    lhs_data: Tensor<T, RANK>,
    rhs_data: Tensor<T, RANK>,
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for DivNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        if let Some(grad) = self.out_grad.borrow().as_ref() {
            // d(x/y)/dx = 1/y
            accumulate(&self.lhs_grad, (grad / &self.rhs_data)?)?;

            // d(x/y)/dy = -x/y^2
            let y_sq = (&self.rhs_data * &self.rhs_data)?;
            let ratio = (&self.lhs_data / &y_sq)?;
            let scaled = (grad * &ratio)?;
            accumulate(&self.rhs_grad, (&Tensor::zeros(*grad.shape()) - &scaled)?)?;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Div for &Variable<T, RANK> {
    type Output = Result<Variable<T, RANK>>;

    fn div(self, rhs: Self) -> Self::Output {
        let data = (&self.data / &rhs.data)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(DivNode {
            lhs_data: self.data.clone(),
            rhs_data: rhs.data.clone(),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

// --- MatMul Node ---
#[derive(Debug)]
struct MatMulNode<T: TensorElem, const RANK: usize> {
    lhs_data: Tensor<T, RANK>,
    rhs_data: Tensor<T, RANK>,
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for MatMulNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        if let Some(grad) = self.out_grad.borrow().as_ref() {
            // C = A @ B
            // dA = dC @ B^T
            // dB = A^T @ dC
            accumulate(&self.lhs_grad, grad.matmul(&self.rhs_data.transpose()?)?)?;
            accumulate(&self.rhs_grad, self.lhs_data.transpose()?.matmul(grad)?)?;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Conv Node ---
/// Convolution of an input with a weight of the same rank (rank 4 for 2D, rank 5 for 3D).
struct ConvNode<T: TensorElem, const RANK: usize> {
    op: &'static str,
    input_data: Tensor<T, RANK>,
    weight_data: Tensor<T, RANK>,
    input_grad: GradCell<T, RANK>,
    weight_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
    #[allow(clippy::type_complexity)]
    grad_fn: Box<
        dyn Fn(
            &Tensor<T, RANK>,
            &Tensor<T, RANK>,
            &Tensor<T, RANK>,
        ) -> Result<(Tensor<T, RANK>, Tensor<T, RANK>)>,
    >,
}

impl<T: TensorElem, const RANK: usize> Debug for ConvNode<T, RANK> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvNode")
            .field("op", &self.op)
            .field("input", self.input_data.shape())
            .field("weight", self.weight_data.shape())
            .finish()
    }
}

impl<T: TensorElem, const RANK: usize> GraphNode for ConvNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        if let Some(grad) = self.out_grad.borrow().as_ref() {
            let (dx, dw) = (self.grad_fn)(&self.input_data, &self.weight_data, grad)?;
            accumulate(&self.input_grad, dx)?;
            accumulate(&self.weight_grad, dw)?;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Unary Node ---
/// A single-input node whose gradient is computed by a stored closure.
pub(crate) struct UnaryNode<T: TensorElem, const IN: usize, const OUT: usize> {
    op: &'static str,
    input_grad: GradCell<T, IN>,
    out_grad: GradCell<T, OUT>,
    parents: Vec<Rc<dyn GraphNode>>,
    #[allow(clippy::type_complexity)]
    grad_fn: Box<dyn Fn(&Tensor<T, OUT>) -> Result<Tensor<T, IN>>>,
}

impl<T: TensorElem, const IN: usize, const OUT: usize> Debug for UnaryNode<T, IN, OUT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnaryNode").field("op", &self.op).finish()
    }
}

impl<T: TensorElem, const IN: usize, const OUT: usize> GraphNode for UnaryNode<T, IN, OUT> {
    fn backward(&self) -> Result<()> {
        if let Some(grad) = self.out_grad.borrow().as_ref() {
            accumulate(&self.input_grad, (self.grad_fn)(grad)?)?;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- LayerNorm Node ---
#[derive(Debug)]
struct LayerNormNode<T: TensorElem, const RANK: usize, const W: usize> {
    /// Normalized input `(x - mean) * rstd`.
    x_hat: Tensor<T, RANK>,
    /// Reciprocal standard deviation per normalized row.
    rstd: Vec<T>,
    weight_data: Tensor<T, W>,
    input_grad: GradCell<T, RANK>,
    weight_grad: GradCell<T, W>,
    bias_grad: GradCell<T, W>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: FloatElem, const RANK: usize, const W: usize> GraphNode for LayerNormNode<T, RANK, W> {
    fn backward(&self) -> Result<()> {
        let out_grad = self.out_grad.borrow();
        let Some(grad) = out_grad.as_ref() else {
            return Ok(());
        };

        let n = self.weight_data.size();
        let n_t = from_usize::<T>(n)?;
        let w = self.weight_data.data();
        let g = grad.data();
        let x_hat = self.x_hat.data();

        let mut dx = vec![T::zero(); g.len()];
        let mut dw = vec![T::zero(); n];
        let mut db = vec![T::zero(); n];

        for (row, dx_row) in dx.chunks_mut(n).enumerate() {
            let base = row * n;
            let mut sum_d = T::zero();
            let mut sum_dx = T::zero();
            for j in 0..n {
                let d = g[base + j] * w[j];
                sum_d = sum_d + d;
                sum_dx = sum_dx + d * x_hat[base + j];
                dw[j] = dw[j] + g[base + j] * x_hat[base + j];
                db[j] = db[j] + g[base + j];
            }
            // dx = rstd / n * (n * dxhat - sum(dxhat) - xhat * sum(dxhat * xhat))
            let scale = self.rstd[row] / n_t;
            for j in 0..n {
                let d = g[base + j] * w[j];
                dx_row[j] = scale * (n_t * d - sum_d - x_hat[base + j] * sum_dx);
            }
        }

        accumulate(&self.input_grad, Tensor::new(dx, *grad.shape())?)?;
        accumulate(&self.weight_grad, Tensor::new(dw, *self.weight_data.shape())?)?;
        accumulate(&self.bias_grad, Tensor::new(db, *self.weight_data.shape())?)?;
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

pub(crate) fn from_usize<T: TensorElem>(n: usize) -> Result<T> {
    T::from_usize(n).ok_or_else(|| TensorError::Unsupported(format!("{} is not representable", n)))
}

impl<T: TensorElem + 'static, const RANK: usize> Variable<T, RANK> {
    /// Records a single-input operation whose output is `data`.
    pub(crate) fn unary<const OUT: usize, F>(
        &self,
        op: &'static str,
        data: Tensor<T, OUT>,
        grad_fn: F,
    ) -> Variable<T, OUT>
    where
        F: Fn(&Tensor<T, OUT>) -> Result<Tensor<T, RANK>> + 'static,
    {
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(UnaryNode {
            op,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
            grad_fn: Box::new(grad_fn),
        });
        Variable::with_node(data, out_grad, node)
    }

    /// Performs batched matrix multiplication between two variables.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let data = self.data.matmul(&rhs.data)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(MatMulNode {
            lhs_data: self.data.clone(),
            rhs_data: rhs.data.clone(),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Sums every element into a scalar.
    pub fn sum(&self) -> Variable<T, 0> {
        let total = Tensor::from_parts(vec![self.data.sum()], []);
        let shape = *self.shape();
        self.unary("sum", total, move |g| Ok(Tensor::full(shape, g.data()[0])))
    }

    /// Arithmetic mean of every element as a scalar.
    pub fn mean(&self) -> Result<Variable<T, 0>> {
        let mean = Tensor::from_parts(vec![self.data.mean()?], []);
        let shape = *self.shape();
        let n = from_usize::<T>(self.data.size())?;
        Ok(self.unary("mean", mean, move |g| {
            Ok(Tensor::full(shape, g.data()[0] / n))
        }))
    }

    /// Elementwise `scale * x + shift`.
    pub fn affine(&self, scale: T, shift: T) -> Self {
        let data = self.data.map(move |x| scale * x + shift);
        self.unary("affine", data, move |g| Ok(g.map(move |d| d * scale)))
    }

    /// Elementwise `scale * x`.
    pub fn scale(&self, scale: T) -> Self {
        self.affine(scale, T::zero())
    }

    /// Rectified linear unit.
    pub fn relu(&self) -> Self {
        let out = self
            .data
            .map(|x| if x > T::zero() { x } else { T::zero() });
        let mask = out.clone();
        self.unary("relu", out, move |g| {
            g.zip_map(&mask, |d, y| if y > T::zero() { d } else { T::zero() })
        })
    }
}

impl<T: FloatElem> Variable<T, 4> {
    /// 2D convolution with a `[out_channels, in_channels, kH, kW]` weight.
    pub fn conv2d(
        &self,
        weight: &Variable<T, 4>,
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
    ) -> Result<Self> {
        let data = self.data.conv2d(&weight.data, stride, padding, dilation)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(ConvNode {
            op: "conv2d",
            input_data: self.data.clone(),
            weight_data: weight.data.clone(),
            input_grad: self.grad.clone(),
            weight_grad: weight.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &weight.node]),
            grad_fn: Box::new(
                move |x: &Tensor<T, 4>, w: &Tensor<T, 4>, g: &Tensor<T, 4>| {
                    Tensor::conv2d_backward(x, w, g, stride, padding, dilation)
                },
            ),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

impl<T: FloatElem> Variable<T, 5> {
    /// 3D convolution with a `[out_channels, in_channels, kD, kH, kW]` weight.
    pub fn conv3d(
        &self,
        weight: &Variable<T, 5>,
        stride: [usize; 3],
        padding: [usize; 3],
        dilation: [usize; 3],
    ) -> Result<Self> {
        let data = self.data.conv3d(&weight.data, stride, padding, dilation)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(ConvNode {
            op: "conv3d",
            input_data: self.data.clone(),
            weight_data: weight.data.clone(),
            input_grad: self.grad.clone(),
            weight_grad: weight.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &weight.node]),
            grad_fn: Box::new(
                move |x: &Tensor<T, 5>, w: &Tensor<T, 5>, g: &Tensor<T, 5>| {
                    Tensor::conv3d_backward(x, w, g, stride, padding, dilation)
                },
            ),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

impl<T: FloatElem, const RANK: usize> Variable<T, RANK> {
    /// Logistic sigmoid `1 / (1 + e^-x)`.
    pub fn sigmoid(&self) -> Self {
        let out = self.data.map(|x| {
            // Evaluate on the side that cannot overflow
            if x >= T::zero() {
                T::one() / (T::one() + (-x).exp())
            } else {
                let e = x.exp();
                e / (T::one() + e)
            }
        });
        let y = out.clone();
        self.unary("sigmoid", out, move |g| {
            g.zip_map(&y, |d, y| d * y * (T::one() - y))
        })
    }

    /// Hyperbolic tangent.
    pub fn tanh(&self) -> Self {
        let out = self.data.map(|x| x.tanh());
        let y = out.clone();
        self.unary("tanh", out, move |g| g.zip_map(&y, |d, y| d * (T::one() - y * y)))
    }

    /// Elementwise absolute value. The subgradient at zero is zero.
    pub fn abs(&self) -> Self {
        let out = self.data.map(|x| x.abs());
        let x = self.data.clone();
        self.unary("abs", out, move |g| {
            g.zip_map(&x, |d, x| {
                if x > T::zero() {
                    d
                } else if x < T::zero() {
                    -d
                } else {
                    T::zero()
                }
            })
        })
    }

    /// `1 - x`, the forget-style complement used by gated updates.
    pub fn one_minus(&self) -> Self {
        self.affine(-T::one(), T::one())
    }

    /// Softmax over the last axis.
    pub fn softmax(&self) -> Self {
        const { assert!(RANK >= 1, "Softmax requires rank >= 1") };
        let width = self.shape()[RANK - 1];

        let mut out = self.data.clone();
        if width > 0 {
            out.data_mut().par_chunks_mut(width).for_each(|row| {
                let max = row.iter().copied().fold(T::neg_infinity(), T::max);
                let mut total = T::zero();
                for v in row.iter_mut() {
                    *v = (*v - max).exp();
                    total = total + *v;
                }
                for v in row.iter_mut() {
                    *v = *v / total;
                }
            });
        }

        let y = out.clone();
        self.unary("softmax", out, move |g| {
            // dx = y * (g - sum(g * y)) per row
            let mut dx = g.clone();
            if width > 0 {
                dx.data_mut()
                    .par_chunks_mut(width)
                    .zip(y.data().par_chunks(width))
                    .for_each(|(d_row, y_row)| {
                        let dot = d_row
                            .iter()
                            .zip(y_row)
                            .fold(T::zero(), |acc, (&d, &y)| acc + d * y);
                        for (d, &y) in d_row.iter_mut().zip(y_row) {
                            *d = y * (*d - dot);
                        }
                    });
            }
            Ok(dx)
        })
    }

    /// Layer normalization over the trailing `W` axes with an elementwise affine transform.
    ///
    /// `weight` and `bias` must have the shape of the trailing `W` axes of `self`.
    pub fn layer_norm<const W: usize>(
        &self,
        weight: &Variable<T, W>,
        bias: &Variable<T, W>,
        eps: T,
    ) -> Result<Self> {
        let trailing = &self.shape()[RANK.saturating_sub(W)..];
        if W > RANK || trailing != weight.shape() || bias.shape() != weight.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: trailing.to_vec(),
                got: weight.shape().to_vec(),
            });
        }

        let n = weight.data.size();
        let n_t = from_usize::<T>(n)?;
        let w = weight.data.data();
        let b = bias.data.data();

        let mut x_hat = self.data.clone();
        let mut out = self.data.clone();
        let mut rstd = Vec::new();
        if n > 0 {
            for (xh_row, y_row) in x_hat
                .data_mut()
                .chunks_mut(n)
                .zip(out.data_mut().chunks_mut(n))
            {
                let mean = xh_row.iter().fold(T::zero(), |acc, &v| acc + v) / n_t;
                let var = xh_row
                    .iter()
                    .fold(T::zero(), |acc, &v| acc + (v - mean) * (v - mean))
                    / n_t;
                let r = T::one() / (var + eps).sqrt();
                for j in 0..n {
                    xh_row[j] = (xh_row[j] - mean) * r;
                    y_row[j] = xh_row[j] * w[j] + b[j];
                }
                rstd.push(r);
            }
        }

        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(LayerNormNode {
            x_hat,
            rstd,
            weight_data: weight.data.clone(),
            input_grad: self.grad.clone(),
            weight_grad: weight.grad.clone(),
            bias_grad: bias.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &weight.node, &bias.node]),
        });
        Ok(Variable::with_node(out, out_grad, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::functional::numerical_grad;

    fn var<const RANK: usize>(data: Vec<f64>, shape: [usize; RANK]) -> Variable<f64, RANK> {
        Variable::new(Tensor::new(data, shape).unwrap())
    }

    fn assert_close(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < tol, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_add_backward() {
        let a = var(vec![2.0], []);
        let b = var(vec![3.0], []);
        let c = (&a + &b).unwrap();
        c.backward().unwrap();

        assert_eq!(a.grad_tensor().unwrap().data()[0], 1.0);
        assert_eq!(b.grad_tensor().unwrap().data()[0], 1.0);
    }

    #[test]
    fn test_mul_backward() {
        let a = var(vec![2.0], []);
        let b = var(vec![3.0], []);
        let c = (&a * &b).unwrap();
        c.backward().unwrap();

        assert_eq!(a.grad_tensor().unwrap().data()[0], 3.0);
        assert_eq!(b.grad_tensor().unwrap().data()[0], 2.0);
    }

    #[test]
    fn test_chain_rule() {
        // y = (a + b) * b, dy/da = b, dy/db = a + 2b
        let a = var(vec![2.0], []);
        let b = var(vec![3.0], []);
        let y = (&(&a + &b).unwrap() * &b).unwrap();
        y.backward().unwrap();

        assert_eq!(a.grad_tensor().unwrap().data()[0], 3.0);
        assert_eq!(b.grad_tensor().unwrap().data()[0], 8.0);
    }

    #[test]
    fn test_sub_div_backward() {
        let a = var(vec![6.0], []);
        let b = var(vec![2.0], []);
        let d = (&a - &b).unwrap();
        d.backward().unwrap();
        assert_eq!(b.grad_tensor().unwrap().data()[0], -1.0);

        let a = var(vec![6.0], []);
        let b = var(vec![2.0], []);
        let q = (&a / &b).unwrap();
        q.backward().unwrap();
        assert_eq!(a.grad_tensor().unwrap().data()[0], 0.5);
        assert_eq!(b.grad_tensor().unwrap().data()[0], -1.5);
    }

    #[test]
    fn test_matmul_backward() {
        // A: [2, 2], B: [2, 1], y = sum(A @ B)
        let a = var(vec![1.0, 2.0, 3.0, 4.0], [2, 2]);
        let b = var(vec![5.0, 6.0], [2, 1]);
        let y = a.matmul(&b).unwrap().sum();
        y.backward().unwrap();

        // dA[i, k] = B[k], dB[k] = sum_i A[i, k]
        assert_eq!(a.grad_tensor().unwrap().data(), &[5.0, 6.0, 5.0, 6.0]);
        assert_eq!(b.grad_tensor().unwrap().data(), &[4.0, 6.0]);
    }

    #[test]
    fn test_shared_variable_accumulates() {
        // Recurrent weights are read at every step: y = w*x1 + w*x2
        let w = var(vec![0.5], []);
        let x1 = var(vec![2.0], []);
        let x2 = var(vec![3.0], []);
        let y = (&(&w * &x1).unwrap() + &(&w * &x2).unwrap()).unwrap();
        y.backward().unwrap();
        assert_eq!(w.grad_tensor().unwrap().data()[0], 5.0);
    }

    #[test]
    fn test_mean_affine_relu() {
        let x = var(vec![-1.0, 2.0, 3.0, -4.0], [4]);
        let y = x.relu().affine(2.0, 1.0).mean().unwrap();
        assert_eq!(y.data.data()[0], (1.0 + 5.0 + 7.0 + 1.0) / 4.0);
        y.backward().unwrap();
        assert_eq!(x.grad_tensor().unwrap().data(), &[0.0, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_sigmoid_tanh_gradients() {
        let x0 = Tensor::new(vec![-2.0, -0.3, 0.0, 0.7, 3.0], [5]).unwrap();
        for op in [Variable::sigmoid as fn(&Variable<f64, 1>) -> Variable<f64, 1>, Variable::tanh] {
            let x = Variable::new(x0.clone());
            op(&x).sum().backward().unwrap();
            let numeric =
                numerical_grad(|t| Ok(op(&Variable::new(t.clone())).data.sum()), &x0, 1e-6)
                    .unwrap();
            assert_close(x.grad_tensor().unwrap().data(), numeric.data(), 1e-6);
        }
    }

    #[test]
    fn test_sigmoid_extremes_are_finite() {
        let x = var(vec![-1000.0, 1000.0], [2]);
        let y = x.sigmoid();
        assert_eq!(y.data.data(), &[0.0, 1.0]);
    }

    #[test]
    fn test_abs_backward() {
        let x = var(vec![-2.0, 0.0, 3.0], [3]);
        x.abs().sum().backward().unwrap();
        assert_eq!(x.grad_tensor().unwrap().data(), &[-1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_softmax_rows_and_gradient() {
        let x0 = Tensor::new(vec![1.0, 2.0, 3.0, -1.0, 0.0, 4.0], [2, 3]).unwrap();
        let weights = Tensor::new(vec![0.3, -1.0, 2.0, 1.5, 0.2, -0.7], [2, 3]).unwrap();

        let x = Variable::new(x0.clone());
        let y = x.softmax();
        let row_sum: f64 = y.data.data()[..3].iter().sum();
        assert!((row_sum - 1.0).abs() < 1e-12);

        let w = Variable::new(weights.clone());
        (&y * &w).unwrap().sum().backward().unwrap();

        let numeric = numerical_grad(
            |t| {
                let y = Variable::new(t.clone()).softmax();
                Ok((&y.data * &weights)?.sum())
            },
            &x0,
            1e-6,
        )
        .unwrap();
        assert_close(x.grad_tensor().unwrap().data(), numeric.data(), 1e-6);
    }

    #[test]
    fn test_conv2d_gradients() {
        let x0 = Tensor::new((0..18).map(|i| (i as f64 * 0.37).sin()).collect(), [1, 2, 3, 3])
            .unwrap();
        let w0 = Tensor::new((0..36).map(|i| (i as f64 * 0.11).cos()).collect(), [2, 2, 3, 3])
            .unwrap();

        let x = Variable::new(x0.clone());
        let w = Variable::new(w0.clone());
        let y = x.conv2d(&w, [1, 1], [1, 1], [1, 1]).unwrap();
        assert_eq!(y.shape(), &[1, 2, 3, 3]);
        y.tanh().sum().backward().unwrap();

        let loss_x = |t: &Tensor<f64, 4>| -> Result<f64> {
            Ok(t.conv2d(&w0, [1, 1], [1, 1], [1, 1])?.map(f64::tanh).sum())
        };
        let loss_w = |t: &Tensor<f64, 4>| -> Result<f64> {
            Ok(x0.conv2d(t, [1, 1], [1, 1], [1, 1])?.map(f64::tanh).sum())
        };
        let nx = numerical_grad(loss_x, &x0, 1e-6).unwrap();
        let nw = numerical_grad(loss_w, &w0, 1e-6).unwrap();
        assert_close(x.grad_tensor().unwrap().data(), nx.data(), 1e-6);
        assert_close(w.grad_tensor().unwrap().data(), nw.data(), 1e-6);
    }

    #[test]
    fn test_conv3d_gradients() {
        let x0 = Tensor::new((0..24).map(|i| (i as f64 * 0.23).cos()).collect(), [1, 1, 2, 3, 4])
            .unwrap();
        let w0 = Tensor::new((0..27).map(|i| (i as f64 * 0.19).sin()).collect(), [1, 1, 3, 3, 3])
            .unwrap();

        let x = Variable::new(x0.clone());
        let w = Variable::new(w0.clone());
        let y = x.conv3d(&w, [1; 3], [1; 3], [1; 3]).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 3, 4]);
        y.sigmoid().sum().backward().unwrap();

        let loss_w = |t: &Tensor<f64, 5>| -> Result<f64> {
            let y = Variable::new(x0.conv3d(t, [1; 3], [1; 3], [1; 3])?).sigmoid();
            Ok(y.data.sum())
        };
        let nw = numerical_grad(loss_w, &w0, 1e-6).unwrap();
        assert_close(w.grad_tensor().unwrap().data(), nw.data(), 1e-6);
    }

    #[test]
    fn test_layer_norm_forward_and_gradients() {
        // Two rows normalized over trailing [2, 2]
        let x0 = Tensor::new(vec![1.0, 2.0, 4.0, 7.0, -1.0, 0.5, 0.0, 2.0], [2, 2, 2]).unwrap();
        let w0 = Tensor::new(vec![1.0, 0.5, -1.0, 2.0], [2, 2]).unwrap();
        let b0 = Tensor::new(vec![0.1, 0.2, 0.3, 0.4], [2, 2]).unwrap();
        let probe = Tensor::new(vec![1.0, -2.0, 0.5, 3.0, 0.7, 1.1, -0.4, 2.2], [2, 2, 2]).unwrap();

        let unit = Variable::new(Tensor::<f64, 2>::ones([2, 2]));
        let zero = Variable::new(Tensor::<f64, 2>::zeros([2, 2]));
        let normalized = Variable::new(x0.clone()).layer_norm(&unit, &zero, 1e-5).unwrap();
        let row = &normalized.data.data()[..4];
        assert!(row.iter().sum::<f64>().abs() < 1e-9);
        let var = row.iter().map(|v| v * v).sum::<f64>() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);

        let x = Variable::new(x0.clone());
        let w = Variable::new(w0.clone());
        let b = Variable::new(b0.clone());
        let y = x.layer_norm(&w, &b, 1e-5).unwrap();
        (&y * &Variable::new(probe.clone())).unwrap().sum().backward().unwrap();

        let loss = |x: &Tensor<f64, 3>, w: &Tensor<f64, 2>| -> Result<f64> {
            let y = Variable::new(x.clone())
                .layer_norm(&Variable::new(w.clone()), &Variable::new(b0.clone()), 1e-5)?;
            Ok((&y.data * &probe)?.sum())
        };
        let nx = numerical_grad(|t| loss(t, &w0), &x0, 1e-6).unwrap();
        let nw = numerical_grad(|t| loss(&x0, t), &w0, 1e-6).unwrap();
        assert_close(x.grad_tensor().unwrap().data(), nx.data(), 1e-5);
        assert_close(w.grad_tensor().unwrap().data(), nw.data(), 1e-5);

        // Bias gradient is the probe summed over rows
        let db = b.grad_tensor().unwrap();
        assert_close(db.data(), &[1.7, -0.9, 0.1, 5.2], 1e-12);
    }

    #[test]
    fn test_layer_norm_shape_error() {
        let x = var(vec![0.0; 6], [2, 3]);
        let w = var(vec![1.0; 2], [2]);
        let b = var(vec![0.0; 2], [2]);
        assert!(matches!(
            x.layer_norm(&w, &b, 1e-5),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}

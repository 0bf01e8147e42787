//! Differentiable layout operations: reshape, permute, narrow/chunk, cat and expand.
//!
//! These move data without arithmetic, so each backward pass is the inverse movement applied to
//! the output gradient.

use super::{GradCell, GraphNode, Variable, accumulate, parents_of};
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use std::cell::RefCell;
use std::rc::Rc;

// --- Cat Node ---
#[derive(Debug)]
struct CatNode<T: TensorElem, const RANK: usize> {
    dim: usize,
    /// Extent of every input along `dim`, in concatenation order.
    extents: Vec<usize>,
    input_grads: Vec<GradCell<T, RANK>>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for CatNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        if let Some(grad) = self.out_grad.borrow().as_ref() {
            let mut offset = 0;
            for (cell, &extent) in self.input_grads.iter().zip(&self.extents) {
                accumulate(cell, grad.narrow(self.dim, offset, extent)?)?;
                offset += extent;
            }
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Variable<T, RANK> {
    /// Reinterprets the data under a new shape with the same number of elements.
    pub fn reshape<const NEW_RANK: usize>(
        &self,
        shape: [usize; NEW_RANK],
    ) -> Result<Variable<T, NEW_RANK>> {
        let data = self.data.clone().reshape(shape)?;
        let input_shape = *self.shape();
        Ok(self.unary("reshape", data, move |g| g.clone().reshape(input_shape)))
    }

    /// Reorders axes: output axis `d` is input axis `axes[d]`.
    pub fn permute(&self, axes: [usize; RANK]) -> Result<Self> {
        let data = self.data.permute(axes)?;
        let mut inverse = [0; RANK];
        for (d, &a) in axes.iter().enumerate() {
            inverse[a] = d;
        }
        Ok(self.unary("permute", data, move |g| g.permute(inverse)))
    }

    /// Selects `len` entries starting at `start` along `dim`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let data = self.data.narrow(dim, start, len)?;
        let full_len = self.shape()[dim];
        Ok(self.unary("narrow", data, move |g| {
            g.narrow_backward(dim, start, full_len)
        }))
    }

    /// Splits `dim` into `chunks` equal parts.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the extent of `dim` is not divisible by `chunks`.
    pub fn chunk(&self, chunks: usize, dim: usize) -> Result<Vec<Self>> {
        if dim >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![dim],
                shape: self.shape().to_vec(),
            });
        }
        let extent = self.shape()[dim];
        if chunks == 0 || extent % chunks != 0 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![chunks],
                got: vec![extent],
            });
        }

        let len = extent / chunks;
        (0..chunks)
            .map(|i| self.narrow(dim, i * len, len))
            .collect()
    }

    /// Concatenates variables along `dim`.
    pub fn cat(parts: &[&Self], dim: usize) -> Result<Self> {
        let tensors: Vec<&Tensor<T, RANK>> = parts.iter().map(|p| &p.data).collect();
        let data = Tensor::concat(&tensors, dim)?;

        let out_grad = Rc::new(RefCell::new(None));
        let nodes: Vec<&Option<Rc<dyn GraphNode>>> = parts.iter().map(|p| &p.node).collect();
        let node = Rc::new(CatNode {
            dim,
            extents: parts.iter().map(|p| p.shape()[dim]).collect(),
            input_grads: parts.iter().map(|p| p.grad.clone()).collect(),
            out_grad: out_grad.clone(),
            parents: parents_of(&nodes),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Broadcasts size-1 axes to `shape`.
    pub fn expand(&self, shape: [usize; RANK]) -> Result<Self> {
        let data = self.data.expand(shape)?;
        let input_shape = *self.shape();
        Ok(self.unary("expand", data, move |g| g.sum_to(input_shape)))
    }
}

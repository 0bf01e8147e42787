//! Tape-based reverse-mode differentiation.
//!
//! Each operation on [`Variable`]s returns a new variable whose [`GraphNode`] remembers the
//! operands it needs for the derivative and the gradient cells of its inputs. Calling
//! [`Variable::backward`] on the loss seeds a gradient of ones and [`engine::backward`] walks
//! the graph from the loss back to the leaves.
//!
//! Gradients accumulate, so a recurrent weight applied at every time step ends up holding the
//! sum over all steps.
//!
//! ```rust
//! use sa_convlstm::autograd::Variable;
//! use sa_convlstm::tensor::Tensor;
//!
//! // d/dw (w * x) = x
//! let w = Variable::new(Tensor::new(vec![0.5], []).unwrap());
//! let x = Variable::new(Tensor::new(vec![3.0], []).unwrap());
//! (&w * &x).unwrap().backward().unwrap();
//! assert_eq!(w.grad_tensor().unwrap().data(), &[3.0]);
//! ```

use crate::tensor::{Result, Tensor, TensorElem};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

pub mod engine;
pub mod functional;
pub mod ops;
pub mod shape;

/// Shared, lazily-filled gradient slot of a variable.
pub type GradCell<T, const RANK: usize> = Rc<RefCell<Option<Tensor<T, RANK>>>>;

/// One recorded operation.
pub trait GraphNode: Debug {
    /// Pushes this node's output gradient into the gradient cells of its inputs.
    fn backward(&self) -> Result<()>;
    /// Nodes that created this node's inputs; leaves have none.
    fn parents(&self) -> Vec<Rc<dyn GraphNode>>;
}

/// A tensor together with its gradient slot and, unless it is a leaf, the node that made it.
#[derive(Clone, Debug)]
pub struct Variable<T, const RANK: usize>
where
    T: TensorElem,
{
    pub data: Tensor<T, RANK>,
    /// d(loss)/d(self), filled during `backward`.
    pub grad: GradCell<T, RANK>,
    pub node: Option<Rc<dyn GraphNode>>,
}

impl<T, const RANK: usize> Variable<T, RANK>
where
    T: TensorElem + 'static,
{
    /// Creates a new leaf variable (a weight or an input batch).
    pub fn new(data: Tensor<T, RANK>) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            node: None,
        }
    }

    /// Creates a variable produced by `node`, whose output gradient lives in `grad`.
    pub fn with_node(
        data: Tensor<T, RANK>,
        grad: GradCell<T, RANK>,
        node: Rc<dyn GraphNode>,
    ) -> Self {
        Self {
            data,
            grad,
            node: Some(node),
        }
    }

    /// Shape of the wrapped tensor.
    pub fn shape(&self) -> &[usize; RANK] {
        self.data.shape()
    }

    /// Copy of the accumulated gradient, if any has flowed here.
    pub fn grad_tensor(&self) -> Option<Tensor<T, RANK>> {
        self.grad.borrow().clone()
    }

    /// Returns a new leaf holding the same data and no history.
    pub fn detach(&self) -> Self {
        Self::new(self.data.clone())
    }

    /// Back-propagates from this variable, seeding its gradient with ones if it has none.
    pub fn backward(&self) -> Result<()> {
        if self.grad.borrow().is_none() {
            *self.grad.borrow_mut() = Some(Tensor::ones(*self.data.shape()));
        }

        engine::backward(self.node.clone())
    }
}

/// Adds `delta` into `cell`, initializing it on first use.
pub(crate) fn accumulate<T, const RANK: usize>(
    cell: &GradCell<T, RANK>,
    delta: Tensor<T, RANK>,
) -> Result<()>
where
    T: TensorElem,
{
    let mut slot = cell.borrow_mut();
    match slot.as_mut() {
        Some(existing) => {
            let sum = (&*existing + &delta)?;
            *existing = sum;
        }
        None => *slot = Some(delta),
    }
    Ok(())
}

/// Collects the creator nodes of a set of inputs.
pub(crate) fn parents_of(nodes: &[&Option<Rc<dyn GraphNode>>]) -> Vec<Rc<dyn GraphNode>> {
    nodes.iter().filter_map(|n| (*n).clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_has_no_history() {
        let w = Variable::new(Tensor::<f32, 1>::zeros([3]));
        assert!(w.node.is_none());
        assert!(w.grad_tensor().is_none());

        // Backward on a leaf only seeds the gradient
        w.backward().unwrap();
        assert_eq!(w.grad_tensor().unwrap().data(), &[1.0; 3]);
    }

    #[test]
    fn test_shared_weight_sums_gradients() {
        // Same weight applied at two "time steps": y = w * x1 + w * x2
        let w = Variable::new(Tensor::new(vec![1.0], []).unwrap());
        let x1 = Variable::new(Tensor::new(vec![2.0], []).unwrap());
        let x2 = Variable::new(Tensor::new(vec![5.0], []).unwrap());
        let y = (&(&w * &x1).unwrap() + &(&w * &x2).unwrap()).unwrap();
        y.backward().unwrap();
        assert_eq!(w.grad_tensor().unwrap().data(), &[7.0]);
    }

    #[test]
    fn test_detach_drops_history() {
        let x = Variable::new(Tensor::new(vec![2.0], []).unwrap());
        let y = (&x * &x).unwrap();
        let d = y.detach();
        assert!(d.node.is_none());
        assert_eq!(d.data.data(), &[4.0]);

        let z = (&d * &x).unwrap();
        z.backward().unwrap();
        // Only the direct path through x contributes
        assert_eq!(x.grad_tensor().unwrap().data(), &[4.0]);
    }

    #[test]
    fn test_accumulate() {
        let cell: GradCell<f32, 1> = Rc::new(RefCell::new(None));
        accumulate(&cell, Tensor::new(vec![1.0, 2.0], [2]).unwrap()).unwrap();
        accumulate(&cell, Tensor::new(vec![0.5, 0.5], [2]).unwrap()).unwrap();
        assert_eq!(cell.borrow().as_ref().unwrap().data(), &[1.5, 2.5]);

        let err = accumulate(&cell, Tensor::new(vec![1.0], [1]).unwrap());
        assert!(err.is_err());
    }
}

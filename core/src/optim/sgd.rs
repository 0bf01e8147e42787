use super::{Optimizer, check_lengths};
use crate::tensor::{Result, TensorElem};
use rayon::prelude::*;

/// Plain gradient descent: `param -= learning_rate * grad`. Stateless, so keys are ignored.
#[derive(Debug, Clone, Copy)]
pub struct Sgd<T: TensorElem> {
    pub learning_rate: T,
}

impl<T: TensorElem> Sgd<T> {
    pub fn new(learning_rate: T) -> Self {
        Self { learning_rate }
    }
}

impl<T: TensorElem> Optimizer<T> for Sgd<T> {
    fn update_slice(&mut self, _key: &str, param: &mut [T], grad: &[T]) -> Result<()> {
        check_lengths(param, grad)?;
        let lr = self.learning_rate;
        param
            .par_iter_mut()
            .zip(grad.par_iter())
            .for_each(|(p, &g)| *p -= lr * g);
        Ok(())
    }

    fn learning_rate(&self) -> T {
        self.learning_rate
    }
}

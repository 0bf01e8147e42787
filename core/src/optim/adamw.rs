use super::{Optimizer, check_lengths};
use crate::tensor::{FloatElem, Result};
use rayon::prelude::*;
use std::collections::HashMap;

/// Per-parameter running moments.
#[derive(Debug)]
struct Moments<T> {
    m: Vec<T>,
    v: Vec<T>,
    step: i32,
}

/// Adam with decoupled weight decay (Loshchilov & Hutter, 2019).
///
/// The decay term `weight_decay * param` is applied next to the normalized gradient instead of
/// being folded into it, so `weight_decay = 0` gives plain Adam. `Adam` in the configuration
/// builds exactly that.
#[derive(Debug)]
pub struct AdamW<T: FloatElem> {
    pub learning_rate: T,
    pub beta1: T,
    pub beta2: T,
    pub epsilon: T,
    pub weight_decay: T,
    state: HashMap<String, Moments<T>>,
}

impl<T: FloatElem> AdamW<T> {
    /// `betas = (0.9, 0.999)`, `epsilon = 1e-8` and `weight_decay = 0.01`.
    pub fn new(learning_rate: T) -> Self {
        Self {
            learning_rate,
            beta1: constant(0.9),
            beta2: constant(0.999),
            epsilon: constant(1e-8),
            weight_decay: constant(0.01),
            state: HashMap::new(),
        }
    }

    pub fn adam(learning_rate: T) -> Self {
        Self::new(learning_rate).with_weight_decay(T::zero())
    }

    pub fn with_betas(mut self, beta1: T, beta2: T) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: T) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: T) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Number of steps taken for `key`, 0 if it was never updated.
    pub fn steps(&self, key: &str) -> i32 {
        self.state.get(key).map_or(0, |moments| moments.step)
    }
}

fn constant<T: FloatElem>(v: f64) -> T {
    // Every float type represents these coefficients, at worst rounded
    T::from_f64(v).unwrap_or_else(T::epsilon)
}

impl<T: FloatElem> Optimizer<T> for AdamW<T> {
    fn update_slice(&mut self, key: &str, param: &mut [T], grad: &[T]) -> Result<()> {
        check_lengths(param, grad)?;

        let size = param.len();
        let moments = self.state.entry(key.to_string()).or_insert_with(|| Moments {
            m: vec![T::zero(); size],
            v: vec![T::zero(); size],
            step: 0,
        });
        check_lengths(param, &moments.m)?;
        moments.step += 1;

        let (b1, b2, eps, decay, lr) = (
            self.beta1,
            self.beta2,
            self.epsilon,
            self.weight_decay,
            self.learning_rate,
        );
        let one = T::one();
        let correction1 = one - b1.powi(moments.step);
        let correction2 = one - b2.powi(moments.step);

        param
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(moments.m.par_iter_mut().zip(moments.v.par_iter_mut()))
            .for_each(|((p, &g), (m, v))| {
                *m = b1 * *m + (one - b1) * g;
                *v = b2 * *v + (one - b2) * g * g;
                let update = (*m / correction1) / ((*v / correction2).sqrt() + eps);
                *p = *p - lr * (update + decay * *p);
            });

        Ok(())
    }

    fn learning_rate(&self) -> T {
        self.learning_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_defaults() {
        let adamw = AdamW::<f32>::new(0.0005);
        assert_eq!((adamw.beta1, adamw.beta2), (0.9, 0.999));
        assert_eq!(adamw.weight_decay, 0.01);
        assert_eq!(AdamW::<f32>::adam(0.0005).weight_decay, 0.0);
    }

    #[test]
    fn test_constant_gradient_moves_by_learning_rate() {
        let mut adam = AdamW::<f32>::adam(0.1);
        let mut param = Tensor::new(vec![1.0, -1.0], [2]).unwrap();
        let grad = Tensor::new(vec![0.1, -0.3], [2]).unwrap();

        // Bias-corrected m/sqrt(v) is sign(g) for a constant gradient
        adam.update("w", &mut param, &grad).unwrap();
        assert!((param.data()[0] - 0.9).abs() < 1e-5);
        assert!((param.data()[1] + 0.9).abs() < 1e-5);

        adam.update("w", &mut param, &grad).unwrap();
        assert!((param.data()[0] - 0.8).abs() < 1e-4);
        assert_eq!(adam.steps("w"), 2);
        assert_eq!(adam.steps("b"), 0);
    }

    #[test]
    fn test_weight_decay_shrinks_without_gradient() {
        let mut adam = AdamW::<f64>::new(0.1).with_weight_decay(0.5);
        let mut param = vec![2.0];
        adam.update_slice("w", &mut param, &[0.0]).unwrap();
        // m_hat = 0, so only the decoupled decay applies: 2 - 0.1 * 0.5 * 2
        assert!((param[0] - 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_state_is_per_key() {
        let mut adam = AdamW::<f64>::adam(0.01);
        let mut a = vec![0.0; 3];
        let mut b = vec![0.0; 2];
        adam.update_slice("a", &mut a, &[1.0, 1.0, 1.0]).unwrap();
        adam.update_slice("b", &mut b, &[1.0, 1.0]).unwrap();
        assert_eq!(adam.steps("a"), 1);
        // A key cannot change size between steps
        assert!(adam.update_slice("a", &mut b, &[1.0, 1.0]).is_err());
    }
}

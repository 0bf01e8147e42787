//! Weight initialization.

use crate::tensor::{FloatElem, Result, Tensor, TensorError};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Initializer for the peephole weights of ConvLSTM cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightsInitializer {
    #[default]
    Zeros,
    /// Kaiming normal, `std = sqrt(2 / fan_in)`.
    He,
    /// Glorot normal, `std = sqrt(2 / (fan_in + fan_out))`.
    Xavier,
}

impl WeightsInitializer {
    /// Draws a tensor of `shape` from this initializer.
    pub fn init<T: FloatElem, const RANK: usize, R: Rng + ?Sized>(
        self,
        shape: [usize; RANK],
        rng: &mut R,
    ) -> Result<Tensor<T, RANK>> {
        let std = match self {
            WeightsInitializer::Zeros => return Ok(Tensor::zeros(shape)),
            WeightsInitializer::He => {
                let (fan_in, _) = fans(&shape)?;
                (2.0 / fan_in as f64).sqrt()
            }
            WeightsInitializer::Xavier => {
                let (fan_in, fan_out) = fans(&shape)?;
                (2.0 / (fan_in + fan_out) as f64).sqrt()
            }
        };
        normal(shape, std, rng)
    }
}

/// `(fan_in, fan_out)` of a weight, treating dims past the second as the receptive field.
///
/// A `[C, H, W]` peephole has `fan_in = H * W` and `fan_out = C * W`.
pub fn fans(shape: &[usize]) -> Result<(usize, usize)> {
    if shape.len() < 2 || shape.contains(&0) {
        return Err(TensorError::Unsupported(format!(
            "fan in/out needs at least 2 non-empty dims, got {:?}",
            shape
        )));
    }
    let receptive: usize = shape[2..].iter().product();
    Ok((shape[1] * receptive, shape[0] * receptive))
}

/// Samples `N(0, std^2)` elementwise.
pub fn normal<T: FloatElem, const RANK: usize, R: Rng + ?Sized>(
    shape: [usize; RANK],
    std: f64,
    rng: &mut R,
) -> Result<Tensor<T, RANK>> {
    let dist = Normal::new(0.0, std)
        .map_err(|e| TensorError::Unsupported(format!("normal(0, {std}): {e}")))?;
    let size = shape.iter().product();
    let data = (0..size)
        .map(|_| cast(dist.sample(rng)))
        .collect::<Result<Vec<T>>>()?;
    Tensor::new(data, shape)
}

/// Samples `U(-bound, bound)` elementwise.
pub fn uniform<T: FloatElem, const RANK: usize, R: Rng + ?Sized>(
    shape: [usize; RANK],
    bound: f64,
    rng: &mut R,
) -> Result<Tensor<T, RANK>> {
    if !(bound.is_finite() && bound > 0.0) {
        return Err(TensorError::Unsupported(format!(
            "uniform bound must be positive, got {bound}"
        )));
    }
    let size = shape.iter().product();
    let data = (0..size)
        .map(|_| cast(rng.random_range(-bound..bound)))
        .collect::<Result<Vec<T>>>()?;
    Tensor::new(data, shape)
}

/// Default convolution init: `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` for kernel and bias alike.
pub fn conv_uniform<T: FloatElem, const RANK: usize, R: Rng + ?Sized>(
    shape: [usize; RANK],
    fan_in: usize,
    rng: &mut R,
) -> Result<Tensor<T, RANK>> {
    uniform(shape, 1.0 / (fan_in.max(1) as f64).sqrt(), rng)
}

fn cast<T: FloatElem>(v: f64) -> Result<T> {
    T::from_f64(v).ok_or_else(|| TensorError::Unsupported(format!("{v} is not representable")))
}

//! Dense row-major tensors.
//!
//! The rank of a [`Tensor`] is part of its type while the extents are runtime values. Video
//! batches are rank 5 `[batch, channels, time, height, width]`, frames are rank 4
//! `[batch, channels, height, width]` and losses are rank 0.
//!
//! ```rust
//! use sa_convlstm::tensor::Tensor;
//!
//! let frame = Tensor::<f32, 2>::new(vec![0.0, 0.5, 1.0, 0.5, 0.0, 0.5], [2, 3]).unwrap();
//! assert_eq!(frame.shape(), &[2, 3]);
//! assert_eq!(frame.strides(), &[3, 1]);
//! ```
//!
//! A tensor always owns one contiguous buffer. Layout operations (`permute`, `narrow`,
//! `concat`) copy, so `strides()` is always the row-major stride of `shape()`.

use num_traits::{Float, FromPrimitive, Num, NumAssign, ToPrimitive};
use sa_convlstm_kernels::KernelError;
use std::fmt::{self, Debug};
use thiserror::Error;

pub mod ops;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// Valid shapes, but an operation this tensor type cannot perform.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl From<KernelError> for TensorError {
    fn from(err: KernelError) -> Self {
        let KernelError::ShapeMismatch { expected, got } = err;
        TensorError::ShapeMismatch { expected, got }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Element types a [`Tensor`] can hold: raw `u8` pixels as well as `f32`/`f64` activations.
pub trait TensorElem:
    Num + NumAssign + Copy + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
    T: Num + NumAssign + Copy + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

/// Floating-point elements, needed by every op with a transcendental (sigmoid, tanh, norms).
pub trait FloatElem: TensorElem + Float + 'static {}

impl<T> FloatElem for T where T: TensorElem + Float + 'static {}

/// An owned N-dimensional array of `T` with rank `RANK`.
///
/// Extent mismatches between operands are reported as [`TensorError::ShapeMismatch`] rather
/// than broadcast; see [`Tensor::expand`] for explicit broadcasting.
#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Wraps `data` as a tensor of the given shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `data.len()` is not the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }
        Ok(Self::from_parts(data, shape))
    }

    /// Builds a tensor from data already known to match `shape`.
    pub(crate) fn from_parts(data: Vec<T>, shape: [usize; RANK]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self {
            shape,
            strides: compute_strides(&shape),
            data,
        }
    }

    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::zero())
    }

    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::one())
    }

    /// A tensor with every element set to `value`.
    pub fn full(shape: [usize; RANK], value: T) -> Self {
        Self::from_parts(vec![value; shape.iter().product()], shape)
    }

    /// Reinterprets the buffer under a new shape of the same size, possibly of another rank.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` when the element counts differ.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK>> {
        let new_size: usize = new_shape.iter().product();
        if self.data.len() != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.data.len()],
                got: vec![new_size],
            });
        }
        Ok(Tensor::from_parts(self.data, new_shape))
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Row-major strides of `shape`.
pub(crate) fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [1; RANK];
    for d in (0..RANK.saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

impl<T: TensorElem, const RANK: usize> Debug for Tensor<T, RANK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_length() {
        let frame = Tensor::<u8, 2>::new(vec![0, 255, 255, 0], [2, 2]).unwrap();
        assert_eq!(frame.data(), &[0, 255, 255, 0]);

        let err = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0], [2, 2]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_constructors() {
        assert_eq!(Tensor::<f32, 2>::zeros([2, 3]).data(), &[0.0; 6]);
        assert_eq!(Tensor::<f32, 1>::ones([2]).data(), &[1.0, 1.0]);
        assert_eq!(Tensor::<u8, 1>::full([3], 7).data(), &[7, 7, 7]);
    }

    #[test]
    fn test_rank_zero_is_a_scalar() {
        let loss = Tensor::<f64, 0>::new(vec![2.5], []).unwrap();
        assert_eq!(loss.size(), 1);
        assert_eq!(loss.strides(), &[] as &[usize; 0]);
    }

    #[test]
    fn test_reshape_frame_to_video() {
        let frames = Tensor::<f32, 2>::zeros([6, 4]);
        let video = frames.clone().reshape([1, 1, 6, 2, 2]).unwrap();
        assert_eq!(video.strides(), &[24, 24, 4, 2, 1]);

        assert!(matches!(
            frames.reshape([5, 5]),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_compute_strides() {
        assert_eq!(compute_strides(&[2, 3, 4]), [12, 4, 1]);
        assert_eq!(compute_strides(&[5]), [1]);
    }

    #[test]
    fn test_kernel_error_conversion() {
        let err: TensorError = KernelError::ShapeMismatch {
            expected: vec![4],
            got: vec![3],
        }
        .into();
        assert_eq!(err.to_string(), "Shape mismatch: expected [4], got [3]");
    }

    #[test]
    fn test_debug_omits_data() {
        let t = crate::tensor!([1.0, 2.0], [2]);
        assert_eq!(format!("{t:?}"), "Tensor { shape: [2], len: 2 }");
    }
}

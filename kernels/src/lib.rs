//! CPU kernels behind the `sa-convlstm` tensors.
//!
//! Kernels take flat row-major slices with explicit shapes and return fresh buffers. Shape
//! bookkeeping beyond what a kernel needs to validate its inputs stays in the tensor layer.

use num_traits::{Num, NumAssign};
use thiserror::Error;

pub mod cpu_conv2d;
pub mod cpu_conv3d;
pub mod cpu_matmul;
pub mod cpu_permute;

pub use cpu_conv2d::{cpu_conv2d, cpu_conv2d_backward_input, cpu_conv2d_backward_weight};
pub use cpu_conv3d::{
    Conv3dGeometry, cpu_conv3d, cpu_conv3d_backward_input, cpu_conv3d_backward_weight,
};
pub use cpu_matmul::cpu_matmul;
pub use cpu_permute::cpu_permute;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Numbers a kernel can multiply and accumulate across `rayon` workers.
pub trait KernelElem: Num + NumAssign + Copy + Send + Sync {}

impl<T> KernelElem for T where T: Num + NumAssign + Copy + Send + Sync {}

/// Errors unless `data` holds exactly `shape.iter().product()` elements.
pub(crate) fn check_len<T>(data: &[T], shape: &[usize]) -> Result<usize> {
    let size = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }
    Ok(size)
}

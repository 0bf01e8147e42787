//! # sa-convlstm
//!
//! Next-frame video prediction with ConvLSTM and Self-Attention ConvLSTM sequence-to-sequence
//! models, plus the harness that trains and evaluates them on Moving MNIST.
//!
//! The models sit on a small CPU tensor type and a tape-based autograd; the raw loops live in
//! the `sa-convlstm-kernels` crate.
//!
//! ## Modules
//!
//! - [`mod@tensor`], [`autograd`]: tensors and reverse-mode differentiation over [`Variable`]s.
//! - [`nn`], [`models`]: convolution and normalization layers, recurrent cells, seq2seq models.
//! - [`loss`], [`optim`]: MSE/L1 losses, Adam(W) and SGD.
//! - [`data`]: datasets, samplers, loaders and Moving MNIST windowing.
//! - [`train`]: trainer with early stopping, evaluator.
//! - [`checkpoint`], [`config`]: safetensors checkpoints and TOML configuration.
//!
//! ```rust
//! use sa_convlstm::tensor::Tensor;
//!
//! // [batch, channels, time, height, width]
//! let video = Tensor::<f32, 5>::zeros([1, 1, 10, 64, 64]);
//! assert_eq!(video.size(), 10 * 64 * 64);
//! ```

/// Builds a [`Tensor`] from an array literal, rejecting a length/shape mismatch at compile time.
///
/// ```rust
/// use sa_convlstm::tensor;
/// use sa_convlstm::tensor::Tensor;
///
/// let t: Tensor<f32, 2> = tensor!([1.0, 2.0, 3.0, 4.0], [2, 2]);
/// assert_eq!(t.shape(), &[2, 2]);
/// ```
///
/// ```compile_fail
/// let t = sa_convlstm::tensor!([1.0, 2.0, 3.0], [2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($data:expr, $shape:expr) => {{
        const _: () = {
            let shape: &[usize] = &$shape;
            let mut expected = 1;
            let mut d = 0;
            while d < shape.len() {
                expected *= shape[d];
                d += 1;
            }
            assert!(
                $data.len() == expected,
                "tensor! data length does not match the shape"
            );
        };
        match $crate::tensor::Tensor::new($data.to_vec(), $shape) {
            Ok(t) => t,
            Err(_) => unreachable!(),
        }
    }};
}

pub mod autograd;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod loss;
pub mod models;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod train;

pub use autograd::Variable;
pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use tensor::{FloatElem, Tensor, TensorElem, TensorError};

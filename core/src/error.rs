//! Error type of the training harness.
//!
//! Tensor and autograd code reports [`TensorError`]; everything that touches files (datasets,
//! checkpoints, metrics, images, configuration) reports this wider [`Error`].

use crate::tensor::TensorError;
use thiserror::Error;

/// Result type alias for the harness.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to write config: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),

    #[error("invalid dataset: {0}")]
    Dataset(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

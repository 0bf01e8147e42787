//! Training, validation and test harness.
//!
//! - [`Trainer`]: epochs of optimization with early stopping and checkpointing.
//! - [`Evaluator`]: per-sample errors and images on the test split.
//! - [`EarlyStopping`]: the patience counter both rely on.

pub mod early_stopping;
pub mod evaluator;
pub mod trainer;

pub use early_stopping::EarlyStopping;
pub use evaluator::{EvaluationSummary, Evaluator, SampleMetrics};
pub use trainer::{EpochMetrics, Trainer, save_metrics};

//! Pipeline configuration.
//!
//! One TOML document with four sections. Every field has a default, so a file only needs the
//! values it changes:
//!
//! ```toml
//! seed = 7
//!
//! [model]
//! num_kernels = 16
//! num_layers = 2
//!
//! [data]
//! path = "data/mnist_test_seq.npy"
//! train_batch_size = 4
//!
//! [training]
//! epochs = 50
//! optimizer = { name = "adamw", weight_decay = 0.01 }
//! ```

use crate::error::{Error, Result};
use crate::loss::LossKind;
use crate::models::Seq2SeqParams;
use crate::optim::OptimizerKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Where the videos come from and how they are windowed and split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// `mnist_test_seq.npy`, or a directory containing it.
    pub path: PathBuf,
    pub train_batch_size: usize,
    /// Leading frames fed to the model.
    pub input_frames: usize,
    /// Frames after the input that the model must predict.
    pub label_frames: usize,
    /// Train / validation / test fractions.
    pub split_ratio: [f64; 3],
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
            train_batch_size: 1,
            input_frames: 10,
            label_frames: 10,
            split_ratio: [0.7, 0.2, 0.1],
        }
    }
}

/// Optimization, early stopping and output locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    /// Epochs without improvement before stopping.
    pub patience: usize,
    /// Minimum decrease of the validation loss that counts as an improvement.
    pub delta: f64,
    pub verbose: bool,
    /// Loss that is optimized.
    pub loss: LossKind,
    /// Secondary criterion reported as accuracy.
    pub accuracy: LossKind,
    pub output_dir: PathBuf,
    /// Per-epoch metrics CSV, relative to `output_dir`. Not written when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_file: Option<String>,
    pub checkpoint_name: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            learning_rate: 0.0005,
            optimizer: OptimizerKind::Adam,
            patience: 30,
            delta: 0.0001,
            verbose: true,
            loss: LossKind::Mse,
            accuracy: LossKind::L1,
            output_dir: PathBuf::from("tmp"),
            metrics_file: Some("metrics.csv".to_string()),
            checkpoint_name: "checkpoint.safetensors".to_string(),
        }
    }
}

impl TrainingConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(&self.checkpoint_name)
    }

    pub fn metrics_path(&self) -> Option<PathBuf> {
        self.metrics_file.as_ref().map(|name| self.output_dir.join(name))
    }

    /// Directory the evaluator writes into.
    pub fn evaluate_dir(&self) -> PathBuf {
        self.output_dir.join("evaluate")
    }
}

/// A complete training and evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seeds weight initialization, the dataset split and shuffling.
    pub seed: u64,
    pub model: Seq2SeqParams,
    pub data: DataConfig,
    pub training: TrainingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            model: Seq2SeqParams::default(),
            data: DataConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file, falling back to the defaults with a warning.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::load(path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "using default configuration");
            Self::default()
        })
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks the cross-section constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        if self.data.input_frames == 0 || self.data.label_frames == 0 {
            return Err(Error::Config(
                "input_frames and label_frames must be positive".into(),
            ));
        }
        if self.data.input_frames != self.model.input_seq_length {
            return Err(Error::Config(format!(
                "data.input_frames ({}) must equal model.input_seq_length ({})",
                self.data.input_frames, self.model.input_seq_length
            )));
        }
        let predicted = match self.model.return_sequences {
            true => self.model.input_seq_length,
            false => 1,
        };
        if self.data.label_frames != predicted {
            return Err(Error::Config(format!(
                "data.label_frames ({}) must equal the {} frames the model predicts",
                self.data.label_frames, predicted
            )));
        }
        if self.data.train_batch_size == 0 {
            return Err(Error::Config("train_batch_size must be positive".into()));
        }
        if self.training.learning_rate <= 0.0 || !self.training.learning_rate.is_finite() {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.training.learning_rate
            )));
        }
        if self.training.delta < 0.0 {
            return Err(Error::Config("delta must not be negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Activation;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.training.learning_rate, 0.0005);
        assert_eq!(config.training.patience, 30);
        assert_eq!(config.training.optimizer, OptimizerKind::Adam);
        assert_eq!(config.data.split_ratio, [0.7, 0.2, 0.1]);
        assert_eq!(
            config.training.checkpoint_path(),
            PathBuf::from("tmp/checkpoint.safetensors")
        );
        assert_eq!(
            config.training.metrics_path(),
            Some(PathBuf::from("tmp/metrics.csv"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: PipelineConfig = toml::from_str(
            r#"
            seed = 3

            [model]
            num_kernels = 8
            activation = "tanh"

            [training]
            epochs = 5
            loss = "l1"
            optimizer = { name = "adamw", weight_decay = 0.1 }
            "#,
        )
        .unwrap();

        assert_eq!(config.seed, 3);
        assert_eq!(config.model.num_kernels, 8);
        assert_eq!(config.model.activation, Activation::Tanh);
        assert_eq!(config.model.frame_size, [64, 64]);
        assert_eq!(config.training.epochs, 5);
        assert_eq!(config.training.loss, LossKind::L1);
        assert_eq!(
            config.training.optimizer,
            OptimizerKind::AdamW { weight_decay: 0.1 }
        );
        assert_eq!(config.data.train_batch_size, 1);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");

        let mut config = PipelineConfig::default();
        config.training.epochs = 12;
        config.training.metrics_file = None;
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_window_matches_model() {
        let mut config = PipelineConfig::default();
        config.data.input_frames = 5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_label_window_matches_prediction() {
        let mut config = PipelineConfig::default();
        config.data.label_frames = 5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        // A single predicted frame needs a single target frame
        config.model.return_sequences = false;
        config.data.label_frames = 10;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.data.label_frames = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_batches() {
        let mut config = PipelineConfig::default();
        config.data.train_batch_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_or_default_on_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "[data]\nlabel_frames = 5\n").unwrap();

        assert!(PipelineConfig::load(&path).is_err());
        assert_eq!(
            PipelineConfig::load_or_default(&path),
            PipelineConfig::default()
        );
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = PipelineConfig::load_or_default("does/not/exist.toml");
        assert_eq!(config, PipelineConfig::default());
    }
}

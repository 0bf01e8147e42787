//! Training loop with validation, early stopping and checkpointing.

use super::EarlyStopping;
use crate::autograd::Variable;
use crate::checkpoint::{CheckpointElem, load_module, save_module};
use crate::config::TrainingConfig;
use crate::data::{Collate, DataLoader, Dataset};
use crate::error::Result;
use crate::models::VideoModel;
use crate::nn::Module;
use crate::optim::Optimizer;
use crate::tensor::Tensor;
use indicatif::{ProgressBar, ProgressStyle};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Losses of one epoch. Accuracy is the secondary criterion (L1 by default), lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub validation_loss: f64,
    pub train_accuracy: f64,
    pub validation_accuracy: f64,
}

impl std::fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "epoch {}: train loss {:.6}, validation loss {:.6}, train acc {:.6}, validation acc {:.6}",
            self.epoch,
            self.train_loss,
            self.validation_loss,
            self.train_accuracy,
            self.validation_accuracy
        )
    }
}

/// Writes `history` as CSV with a header row.
pub fn save_metrics<P: AsRef<Path>>(path: P, history: &[EpochMetrics]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for metrics in history {
        writer.serialize(metrics)?;
    }
    writer.flush()?;
    Ok(())
}

/// Running mean of per-batch values.
#[derive(Debug, Default, Clone, Copy)]
struct Mean {
    total: f64,
    count: usize,
}

impl Mean {
    fn add(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    /// `NaN` when nothing was added.
    fn get(self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.total / self.count as f64
        }
    }
}

/// Fits a [`VideoModel`] on `(input, target)` batches.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Trains for up to `config.epochs` epochs.
    ///
    /// After every epoch the validation loss goes through early stopping; an improvement saves
    /// the model to [`TrainingConfig::checkpoint_path`]. When training ends the best saved
    /// parameters are loaded back into `model`. Returns the per-epoch history, which is also
    /// written to [`TrainingConfig::metrics_path`] when set.
    pub fn run<T, M, D, I, C>(
        &self,
        model: &mut M,
        optimizer: &mut dyn Optimizer<T>,
        train_loader: &DataLoader<D, I, C>,
        valid_loader: &DataLoader<D, I, C>,
    ) -> Result<Vec<EpochMetrics>>
    where
        T: CheckpointElem,
        M: VideoModel<T>,
        D: Dataset<I>,
        C: Collate<I, Output = Result<(Tensor<T, 5>, Tensor<T, 5>)>>,
    {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let checkpoint = self.config.checkpoint_path();

        if train_loader.is_empty() {
            warn!("training split has no batches");
        }
        if valid_loader.is_empty() {
            warn!("validation split has no batches, validation loss will be NaN");
        }

        let mut early_stopping =
            EarlyStopping::new(self.config.patience, self.config.delta, self.config.verbose);
        let mut history = Vec::with_capacity(self.config.epochs);
        let mut saved = false;

        let pb = if self.config.verbose {
            ProgressBar::new(self.config.epochs as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );

        for epoch in 1..=self.config.epochs {
            let (train_loss, train_accuracy) = self.train_epoch(model, optimizer, train_loader)?;
            let (validation_loss, validation_accuracy) = self.validate(model, valid_loader)?;
            let metrics = EpochMetrics {
                epoch,
                train_loss,
                validation_loss,
                train_accuracy,
                validation_accuracy,
            };
            info!("{metrics}");
            pb.set_message(format!("val loss {validation_loss:.6}"));
            pb.inc(1);
            history.push(metrics);

            if early_stopping.step(validation_loss) {
                save_module(&checkpoint, model)?;
                saved = true;
                info!(path = %checkpoint.display(), "saved checkpoint");
            }
            if early_stopping.early_stop() {
                warn!("early stopping at epoch {epoch}");
                break;
            }
        }
        pb.finish_with_message("training complete");

        if let Some(path) = self.config.metrics_path() {
            save_metrics(&path, &history)?;
            info!(path = %path.display(), "saved metrics");
        }

        if saved {
            load_module(&checkpoint, model)?;
            info!(
                val_loss = early_stopping.val_loss_min(),
                "restored best checkpoint"
            );
        }

        Ok(history)
    }

    /// One pass over `loader` with parameter updates. Returns mean loss and accuracy.
    fn train_epoch<T, M, D, I, C>(
        &self,
        model: &mut M,
        optimizer: &mut dyn Optimizer<T>,
        loader: &DataLoader<D, I, C>,
    ) -> Result<(f64, f64)>
    where
        T: CheckpointElem,
        M: VideoModel<T>,
        D: Dataset<I>,
        C: Collate<I, Output = Result<(Tensor<T, 5>, Tensor<T, 5>)>>,
    {
        let mut loss_mean = Mean::default();
        let mut accuracy_mean = Mean::default();

        for (batch_idx, batch) in loader.iter().enumerate() {
            let (input, target) = batch?;
            let input = Variable::new(input);
            let target = Variable::new(target);

            model.zero_grad();
            let prediction = model.forward(&input)?;
            let loss = self.config.loss.compute(&prediction, &target)?;
            loss.backward()?;
            optimizer.step(model)?;

            let loss_value = loss.data.data()[0].to_f64().unwrap_or(f64::NAN);
            let accuracy = self.config.accuracy.value(&prediction, &target)?;
            debug!(batch = batch_idx, loss = loss_value, "train step");
            loss_mean.add(loss_value);
            accuracy_mean.add(accuracy);
        }
        Ok((loss_mean.get(), accuracy_mean.get()))
    }

    /// Mean loss and accuracy over `loader` without updates.
    pub fn validate<T, M, D, I, C>(
        &self,
        model: &M,
        loader: &DataLoader<D, I, C>,
    ) -> Result<(f64, f64)>
    where
        T: CheckpointElem,
        M: VideoModel<T>,
        D: Dataset<I>,
        C: Collate<I, Output = Result<(Tensor<T, 5>, Tensor<T, 5>)>>,
    {
        let mut loss_mean = Mean::default();
        let mut accuracy_mean = Mean::default();

        for batch in loader {
            let (input, target) = batch?;
            let input = Variable::new(input);
            let target = Variable::new(target);

            let prediction = model.forward(&input)?;
            loss_mean.add(self.config.loss.value(&prediction, &target)?);
            accuracy_mean.add(self.config.accuracy.value(&prediction, &target)?);
        }
        Ok((loss_mean.get(), accuracy_mean.get()))
    }
}

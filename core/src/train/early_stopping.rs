//! Early stopping on the validation loss.

use tracing::info;

/// Stops training once the validation loss has not improved for `patience` epochs.
///
/// A loss improves when `-loss > best_score + delta`. The first finite loss always counts as
/// an improvement; `NaN` never does.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    delta: f64,
    verbose: bool,
    counter: usize,
    best_score: Option<f64>,
    val_loss_min: f64,
    early_stop: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, delta: f64, verbose: bool) -> Self {
        Self {
            patience,
            delta,
            verbose,
            counter: 0,
            best_score: None,
            val_loss_min: f64::INFINITY,
            early_stop: false,
        }
    }

    /// Records one epoch's validation loss. Returns `true` when it is the best so far and the
    /// model should be checkpointed.
    pub fn step(&mut self, val_loss: f64) -> bool {
        let score = -val_loss;
        let improved = match self.best_score {
            _ if score.is_nan() => false,
            None => true,
            Some(best) => score > best + self.delta,
        };

        if improved {
            if self.verbose {
                info!(
                    "validation loss decreased ({:.6} --> {:.6})",
                    self.val_loss_min, val_loss
                );
            }
            self.best_score = Some(score);
            self.val_loss_min = val_loss;
            self.counter = 0;
        } else {
            self.counter += 1;
            if self.verbose {
                info!("early stopping counter: {} out of {}", self.counter, self.patience);
            }
            if self.counter >= self.patience {
                self.early_stop = true;
            }
        }
        improved
    }

    /// Whether training should stop.
    pub fn early_stop(&self) -> bool {
        self.early_stop
    }

    /// Epochs since the last improvement.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Lowest validation loss seen, `inf` before the first improvement.
    pub fn val_loss_min(&self) -> f64 {
        self.val_loss_min
    }
}

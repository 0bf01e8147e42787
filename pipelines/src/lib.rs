//! Moving MNIST training pipelines.
//!
//! Both binaries share [`Cli`] and [`run_pipeline`]; they differ only in the recurrent cell.

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use sa_convlstm::PipelineConfig;
use sa_convlstm::data::{MovingMnist, MovingMnistDataLoaders};
use sa_convlstm::models::{RecurrentCell, Seq2SeqModel};
use sa_convlstm::nn::Module;
use sa_convlstm::train::{EpochMetrics, EvaluationSummary, Evaluator, Trainer};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Command-line overrides on top of the TOML configuration.
#[derive(Debug, Parser)]
#[command(about = "Train and evaluate a video prediction model on Moving MNIST", long_about = None)]
pub struct Cli {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// `mnist_test_seq.npy`, or the directory holding it
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Number of training epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Directory for checkpoints, metrics and evaluation output
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Seed for initialization, splitting and shuffling
    #[arg(short, long)]
    pub seed: Option<u64>,
}

impl Cli {
    /// Loads the configuration file, if any, and applies the overrides.
    pub fn resolve(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if let Some(data) = &self.data {
            config.data.path = data.clone();
        }
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(output_dir) = &self.output_dir {
            config.training.output_dir = output_dir.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to info for this workspace.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sa_convlstm=info,sa_convlstm_pipelines=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init()
        .ok();
}

/// What a pipeline run produced.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub history: Vec<EpochMetrics>,
    pub evaluation: EvaluationSummary,
}

/// Loads the data, trains a seq2seq model built on cell `C`, then evaluates it.
pub fn run_pipeline<C: RecurrentCell<f32>>(config: &PipelineConfig) -> Result<PipelineReport> {
    info!("loading dataset ...");
    let dataset = MovingMnist::load(&config.data.path)
        .with_context(|| format!("failed to load {}", config.data.path.display()))?;
    if dataset.frame_size() != config.model.frame_size {
        bail!(
            "dataset frames are {:?} but the model expects {:?}",
            dataset.frame_size(),
            config.model.frame_size
        );
    }
    let loaders = MovingMnistDataLoaders::<f32>::new(dataset, &config.data, config.seed)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut model = Seq2SeqModel::<f32, C>::new(config.model.clone(), &mut rng)?;
    let mut optimizer = config
        .training
        .optimizer
        .build::<f32>(config.training.learning_rate)?;
    info!(
        layer = C::LAYER_NAME,
        parameters = model.num_parameters(),
        "built model"
    );

    info!("training ...");
    let trainer = Trainer::new(config.training.clone());
    let history = trainer.run(
        &mut model,
        optimizer.as_mut(),
        &loaders.train,
        &loaders.validation,
    )?;

    info!("evaluating ...");
    let evaluator = Evaluator::new(config.training.evaluate_dir());
    let evaluation = evaluator.run(&model, &loaders.test)?;

    Ok(PipelineReport {
        history,
        evaluation,
    })
}

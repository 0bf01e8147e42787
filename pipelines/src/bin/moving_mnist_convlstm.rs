use anyhow::Result;
use clap::Parser;
use sa_convlstm::models::ConvLstmCell;
use sa_convlstm_pipelines::{Cli, run_pipeline, setup_logging};
use tracing::info;

fn main() -> Result<()> {
    setup_logging();
    let config = Cli::parse().resolve()?;

    let report = run_pipeline::<ConvLstmCell<f32>>(&config)?;
    info!(
        epochs = report.history.len(),
        test_mse = report.evaluation.mse,
        test_mae = report.evaluation.mae,
        "ConvLSTM pipeline finished"
    );
    Ok(())
}

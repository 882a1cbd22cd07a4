mod checkpoint;
mod cli;
mod collaborators;
mod config;
mod discovery;
mod error;
mod gate;
mod lrc;
mod memory;
mod paths;
mod pipeline;
mod pools;
mod process;
mod record;
mod report;
mod runner;
#[cfg(test)]
mod testing;
mod types;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use collaborators::Collaborators;
use config::Config;
use runner::BatchOrchestrator;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    cli.validate()?;
    let config = Config::from_cli(&cli)?;
    config.validate()?;
    let collaborators = Collaborators::from_config(&config)?;

    // Set up shutdown signal handler: the first Ctrl+C stops new work, the
    // second drops in-flight stages (killing their child processes)
    let cancel = CancellationToken::new();
    let abort = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_abort = abort.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        warn!("Received Ctrl+C, finishing in-flight work (press again to abort)");
        signal_cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second Ctrl+C, aborting in-flight work");
            signal_abort.cancel();
        }
    });

    info!(
        input = %config.input_dir.display(),
        output = %config.output_dir.display(),
        report = %config.csv_output.display(),
        "Starting"
    );

    let report = BatchOrchestrator::new(config, collaborators, cancel)
        .with_abort(abort.clone())
        .run()
        .await?;
    if abort.is_cancelled() {
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::from(report.summary().exit_code()))
}

// src/cli/handlers/repository.rs

use crate::{
    CancellationToken,
    cli::handlers::commons,
    core::{
        config_loader,
        pipeline::{ActionPipeline, PipelineReport},
    },
    models::ActionKind,
    system::executor::ProcessBackend,
};
use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Run interrupted.")]
    Interrupted,
    #[error("{failed} of {total} repositories failed.")]
    Failed { failed: usize, total: usize },
}

/// Entry point for `fetch`, `install`, `build`, `clean` and `all`.
pub async fn handle(
    config: Option<&Path>,
    command: &str,
    actions: &[ActionKind],
    cancel: CancellationToken,
) -> Result<()> {
    let config = commons::load_config(config)?;
    let targets = config_loader::resolve_targets(&config)?;
    if targets.is_empty() {
        println!("{}", "No repositories configured. Nothing to do.".yellow());
        return Ok(());
    }

    let env = commons::capture_environment(&config.versions).await?;
    println!(
        "{} '{}' on {} repositories...",
        "Running".green().bold(),
        command.cyan(),
        targets.len()
    );

    // Ctrl+C cancels the run; in-flight children are killed by the executor.
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received, stopping all repositories...");
                cancel.cancel();
            }
        }
    });

    let pipeline = ActionPipeline::new(
        Arc::new(ProcessBackend),
        env,
        config.versions.clone(),
        cancel.clone(),
    );
    let report = pipeline.run(actions, &targets).await;
    watcher.abort();

    print_failures(&report);
    if cancel.is_cancelled() {
        return Err(RunError::Interrupted.into());
    }

    if report.is_success() {
        println!(
            "{} '{}' finished for all {} repositories.",
            "Done:".green().bold(),
            command,
            report.targets
        );
        return Ok(());
    }

    Err(RunError::Failed {
        failed: report.failures.len(),
        total: report.targets,
    }
    .into())
}

/// Prints one line per failing target. Returns how many lines were printed.
fn print_failures(report: &PipelineReport) -> usize {
    for failure in &report.failures {
        eprintln!("{} {}", "✖".red().bold(), failure.to_string().red());
    }
    report.failures.len()
}

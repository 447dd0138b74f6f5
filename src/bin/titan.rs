// src/bin/titan.rs

use titan::{
    CancellationToken,
    cli::{self, Cli, handlers::repository::RunError},
};
use clap::Parser;
use colored::*;

/// The main entry point of the `titan` application.
/// It sets up logging, parses arguments, dispatches to the correct handler,
/// and performs centralized error handling.
#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cancellation_token = CancellationToken::new();

    if let Err(e) = cli::dispatch(Cli::parse(), cancellation_token).await {
        // --- Centralized Error Handling ---
        if let Some(RunError::Interrupted) = e.downcast_ref::<RunError>() {
            // Exit like a shell does after Ctrl+C.
            eprintln!("\n{}", "Interrupted.".yellow());
            std::process::exit(130);
        }

        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

// src/cli/handlers/commons.rs

// Shared steps used by every handler.

use crate::{
    core::config_loader,
    models::{TitanConfig, Versions},
    system::environment::{self, SharedEnvironment},
};
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;

/// Locates and parses the configuration file.
pub fn load_config(explicit: Option<&Path>) -> Result<TitanConfig> {
    let path = config_loader::resolve_config_path(explicit)?;
    log::info!("Using configuration '{}'", path.display());
    let config = config_loader::load(&path)?;
    Ok(config)
}

/// Captures the environment every child process will run with.
pub async fn capture_environment(versions: &Versions) -> Result<SharedEnvironment> {
    if versions.node.is_some() || versions.pnpm.is_some() {
        println!(
            "{} node {} / pnpm {}",
            "Preparing".green().bold(),
            versions.node.as_deref().unwrap_or("(unset)").cyan(),
            versions.pnpm.as_deref().unwrap_or("(unset)").cyan()
        );
    }
    environment::capture(versions)
        .await
        .context("Failed to capture the shared environment")
}

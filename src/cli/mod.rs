// src/cli/mod.rs

use crate::{CancellationToken, core::pipeline, models::ActionKind};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod handlers;

/// titan: Run repository actions in parallel and serve local applications behind a proxy.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about = None,
    styles = clap::builder::Styles::styled()
        .header(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .usage(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .literal(clap::builder::styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(clap::builder::styling::AnsiColor::Green.on_default()),
)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Configuration file. Defaults to `./titan.yaml`, then `<config_dir>/titan/titan.yaml`.
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch and pull every repository.
    Fetch,
    /// Install dependencies in every repository.
    Install,
    /// Build every repository.
    Build,
    /// Remove build output and installed dependencies.
    Clean,
    /// Fetch, clean, install and build, in that order.
    All,
    /// Start a profile's applications and the reverse proxy.
    Serve {
        /// Name of the profile under `server.profiles`.
        #[arg(short, long)]
        profile: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Fetch => "fetch",
            Command::Install => "install",
            Command::Build => "build",
            Command::Clean => "clean",
            Command::All => "all",
            Command::Serve { .. } => "serve",
        }
    }

    /// The repository actions this command runs. `None` for `serve`.
    pub fn repository_actions(&self) -> Option<Vec<ActionKind>> {
        match self {
            Command::Serve { .. } => None,
            other => pipeline::actions_for_command(other.name()),
        }
    }
}

/// Routes a parsed command line to its handler.
pub async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);
    let config = cli.config.as_deref();

    match &cli.command {
        Command::Serve { profile } => handlers::serve::handle(config, profile, cancel).await,
        command => {
            let actions = command.repository_actions().unwrap_or_default();
            handlers::repository::handle(config, command.name(), &actions, cancel).await
        }
    }
}

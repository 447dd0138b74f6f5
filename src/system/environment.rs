// src/system/environment.rs

//! # Shared Environment
//!
//! Every child process runs with one environment snapshot captured at startup.
//! The snapshot is taken from a bash shell that has already bootstrapped the
//! configured Node and pnpm versions, so children see the same `PATH` and tool
//! setup regardless of what the invoking shell had loaded.

use crate::models::Versions;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("Failed to launch the environment bootstrap shell: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Environment bootstrap failed ({status}): {stderr}")]
    Bootstrap { status: String, stderr: String },
    #[error("Version '{0}' cannot be passed safely to the shell.")]
    UnsafeVersion(String),
}

/// An immutable, cheaply clonable set of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedEnvironment(Arc<BTreeMap<String, String>>);

impl SharedEnvironment {
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(Arc::new(
            vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ))
    }

    /// Snapshot of the current process environment, without any bootstrap.
    pub fn inherit() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Builds the bash snippet that installs and activates the configured versions.
///
/// Steps whose version is not configured are omitted entirely. The snippet always
/// ends by dumping the resulting environment as NUL-separated entries.
pub fn bootstrap_script(versions: &Versions) -> Result<String, EnvironmentError> {
    let mut steps: Vec<String> = Vec::new();

    if let Some(node) = non_blank(versions.node.as_deref()) {
        let node = quote(node)?;
        steps.push("export NVM_DIR=\"${NVM_DIR:-$HOME/.nvm}\"".to_string());
        steps.push("source \"$NVM_DIR/nvm.sh\"".to_string());
        steps.push(format!("nvm install {node} >&2"));
        steps.push(format!("nvm use {node} >&2"));
    }
    if let Some(pnpm) = non_blank(versions.pnpm.as_deref()) {
        let pnpm = quote(pnpm)?;
        steps.push(format!("npm i -g pnpm@{pnpm} >&2"));
    }
    steps.push("env -0".to_string());

    Ok(steps.join(" && "))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn quote(value: &str) -> Result<String, EnvironmentError> {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| EnvironmentError::UnsafeVersion(value.to_string()))
}

/// Parses the output of `env -0` into key/value pairs.
///
/// Entries are split at the first `=`; entries without one are ignored.
pub fn parse_env_output(output: &[u8]) -> Vec<(String, String)> {
    output
        .split(|byte| *byte == 0)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            entry
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Runs the bootstrap once and captures the resulting environment.
///
/// # Errors
/// Fails when bash cannot be launched or the bootstrap exits unsuccessfully.
pub async fn capture(versions: &Versions) -> Result<SharedEnvironment, EnvironmentError> {
    let script = bootstrap_script(versions)?;
    log::debug!("Capturing shared environment: bash -c '{}'", script);

    let output = Command::new("bash")
        .arg("-c")
        .arg(&script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(EnvironmentError::Spawn)?;

    if !output.status.success() {
        return Err(EnvironmentError::Bootstrap {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let env = SharedEnvironment::from_vars(parse_env_output(&output.stdout));
    log::info!("Captured shared environment ({} variables).", env.len());
    Ok(env)
}

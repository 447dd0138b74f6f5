// src/system/executor.rs

use crate::{
    CancellationToken,
    constants::{SCRIPT_PREAMBLE, TEMP_SCRIPT_PREFIX},
    system::environment::SharedEnvironment,
};
use colored::Colorize;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Command could not be parsed: {0}")]
    CommandParse(String),
    #[error("No command specified to run.")]
    EmptyCommand,
    #[error("Command '{0}' could not be executed: {1}")]
    CommandFailed(String, #[source] std::io::Error),
    #[error("Command '{command}' exited with {status}.")]
    NonZeroExitStatus { command: String, status: ExitStatus },
    #[error("Could not write the action script to a temporary file: {0}")]
    ScriptFile(#[source] std::io::Error),
    #[error("Operation was cancelled.")]
    Cancelled,
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// A program and its arguments. An empty argument list with a program that
    /// contains whitespace is split as a shell command line.
    Command { program: String, args: Vec<String> },
    /// A bash script body. The standard preamble is added before it runs.
    Script(String),
}

/// A single unit of external work.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Prefix shown in front of every output line.
    pub label: String,
    pub invocation: Invocation,
    pub cwd: PathBuf,
    pub env: SharedEnvironment,
    pub cancel: CancellationToken,
}

/// Runs external work on behalf of the engines.
///
/// The process-spawning implementation is [`ProcessBackend`]; tests substitute
/// recording backends to observe what the engines ask for.
pub trait ExecutionBackend: Send + Sync + 'static {
    fn execute(
        &self,
        request: ExecRequest,
    ) -> impl Future<Output = Result<(), ExecutionError>> + Send;
}

/// Spawns real child processes, streaming their output line by line.
///
/// Children run with exactly the captured shared environment. When the request's
/// cancellation token fires, the child is killed and reaped before
/// [`ExecutionError::Cancelled`] is returned.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessBackend;

impl ExecutionBackend for ProcessBackend {
    async fn execute(&self, request: ExecRequest) -> Result<(), ExecutionError> {
        if request.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        match &request.invocation {
            Invocation::Command { program, args } => {
                let (program, args) = split_command(program, args)?;
                let display = std::iter::once(program.as_str())
                    .chain(args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ");
                run_process(&request, &program, &args, &display).await
            }
            Invocation::Script(body) => {
                // Removed from disk when dropped, after the child has exited.
                let script = write_script(body)?;
                let args = vec![script.to_string_lossy().into_owned()];
                let display = format!("{} script", request.label);
                run_process(&request, "bash", &args, &display).await
            }
        }
    }
}

/// Resolves the program and arguments, splitting a bare command line when needed.
pub fn split_command(
    program: &str,
    args: &[String],
) -> Result<(String, Vec<String>), ExecutionError> {
    let trimmed = program.trim();
    if trimmed.is_empty() {
        return Err(ExecutionError::EmptyCommand);
    }
    if !args.is_empty() || !trimmed.contains(char::is_whitespace) {
        return Ok((trimmed.to_string(), args.to_vec()));
    }

    let mut parts = shlex::split(trimmed)
        .ok_or_else(|| ExecutionError::CommandParse(trimmed.to_string()))?
        .into_iter();
    let head = parts.next().ok_or(ExecutionError::EmptyCommand)?;
    Ok((head, parts.collect()))
}

/// Writes the preamble and body to an executable temp file.
fn write_script(body: &str) -> Result<tempfile::TempPath, ExecutionError> {
    let mut file = tempfile::Builder::new()
        .prefix(TEMP_SCRIPT_PREFIX)
        .suffix(".sh")
        .tempfile()
        .map_err(ExecutionError::ScriptFile)?;
    file.write_all(SCRIPT_PREAMBLE.as_bytes())
        .and_then(|_| file.write_all(body.as_bytes()))
        .and_then(|_| file.flush())
        .map_err(ExecutionError::ScriptFile)?;
    log::trace!("Action script written to '{}'", file.path().display());
    Ok(file.into_temp_path())
}

async fn run_process(
    request: &ExecRequest,
    program: &str,
    args: &[String],
    display: &str,
) -> Result<(), ExecutionError> {
    let cwd = dunce::simplified(&request.cwd);
    log::debug!(
        "[{}] spawning '{}' in '{}'",
        request.label,
        display,
        cwd.display()
    );

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(request.env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| ExecutionError::CommandFailed(display.to_string(), e))?;

    let mut streams = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        streams.push(tokio::spawn(stream_lines(stdout, request.label.clone(), false)));
    }
    if let Some(stderr) = child.stderr.take() {
        streams.push(tokio::spawn(stream_lines(stderr, request.label.clone(), true)));
    }

    let outcome = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| ExecutionError::CommandFailed(display.to_string(), e))
        }
        _ = request.cancel.cancelled() => {
            log::debug!(
                "[{}] cancellation requested, killing child process (PID: {:?})...",
                request.label,
                child.id()
            );
            if let Err(e) = child.start_kill() {
                log::warn!("[{}] failed to kill child process: {}", request.label, e);
            }
            // Reap the process so it does not linger as a zombie.
            child.wait().await.ok();
            for stream in streams {
                stream.abort();
            }
            return Err(ExecutionError::Cancelled);
        }
    };

    for stream in streams {
        stream.await.ok();
    }

    let status = outcome?;
    if !status.success() {
        return Err(ExecutionError::NonZeroExitStatus {
            command: display.to_string(),
            status,
        });
    }
    Ok(())
}

/// Forwards a child pipe to the console, prefixing each line with the unit label.
async fn stream_lines<R: AsyncRead + Unpin>(reader: R, label: String, is_stderr: bool) {
    let prefix = format!("[{}]", label);
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => eprintln!("{} {}", prefix.yellow(), line),
            Ok(Some(line)) => println!("{} {}", prefix.cyan(), line),
            Ok(None) => break,
            Err(e) => {
                log::debug!("{} output stream closed: {}", prefix, e);
                break;
            }
        }
    }
}

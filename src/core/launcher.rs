// src/core/launcher.rs

//! # Task Launcher
//!
//! Starts the background application actions a serve profile asks for. Tasks are
//! plain fan-out: they have no ordering, and a failing task never stops its
//! siblings. Failures go to the shared error queue, where the serve controller
//! decides what to do about them.

use crate::{
    CancellationToken,
    core::report::{self, ErrorSender, UnitError},
    models::{Application, ApplicationAction, TaskRef},
    system::{
        environment::SharedEnvironment,
        executor::{ExecRequest, ExecutionBackend, ExecutionError, Invocation},
    },
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("application '{0}' not found")]
    ApplicationNotFound(String),
    #[error("action '{action}' not found on application '{application}'")]
    ActionNotFound { application: String, action: String },
}

#[derive(Error, Debug)]
pub enum TaskFailure {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Looks up the application and action a task refers to.
pub fn resolve<'a>(
    applications: &'a BTreeMap<String, Application>,
    task: &TaskRef,
) -> Result<(&'a Application, &'a ApplicationAction), ResolutionError> {
    let application = applications
        .get(&task.name)
        .ok_or_else(|| ResolutionError::ApplicationNotFound(task.name.clone()))?;
    let action = application
        .actions
        .get(&task.action)
        .ok_or_else(|| ResolutionError::ActionNotFound {
            application: task.name.clone(),
            action: task.action.clone(),
        })?;
    Ok((application, action))
}

#[derive(Debug)]
pub struct TaskLauncher<B: ExecutionBackend> {
    backend: Arc<B>,
    env: SharedEnvironment,
    applications: Arc<BTreeMap<String, Application>>,
    cancel: CancellationToken,
}

impl<B: ExecutionBackend> TaskLauncher<B> {
    pub fn new(
        backend: Arc<B>,
        env: SharedEnvironment,
        applications: BTreeMap<String, Application>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            env,
            applications: Arc::new(applications),
            cancel,
        }
    }

    /// Spawns one unit per task onto `units`. Returns immediately.
    ///
    /// Each unit resolves its task and runs the action's command in the
    /// application's directory. A unit that ends because the run was cancelled
    /// reports nothing.
    pub fn launch(&self, tasks: &[TaskRef], units: &mut JoinSet<()>, errors: &ErrorSender) {
        for task in tasks {
            if let Some(kind) = task.kind.as_deref().filter(|k| *k != "application") {
                log::warn!(
                    "Task '{}:{}' has unsupported type '{}', treating it as an application task.",
                    task.name,
                    task.action,
                    kind
                );
            }

            let backend = Arc::clone(&self.backend);
            let env = self.env.clone();
            let applications = Arc::clone(&self.applications);
            let cancel = self.cancel.clone();
            let errors = errors.clone();
            let task = task.clone();

            units.spawn(async move {
                let outcome = run_task(backend.as_ref(), &applications, &task, env, cancel).await;
                match outcome {
                    Ok(()) => log::info!("[{}:{}] task finished.", task.name, task.action),
                    Err(TaskFailure::Execution(ExecutionError::Cancelled)) => {
                        log::debug!("[{}:{}] task stopped by shutdown.", task.name, task.action)
                    }
                    Err(source) => {
                        report::report(
                            &errors,
                            UnitError::Task {
                                application: task.name.clone(),
                                action: task.action.clone(),
                                source,
                            },
                        )
                        .await
                    }
                }
            });
        }
    }
}

async fn run_task<B: ExecutionBackend>(
    backend: &B,
    applications: &BTreeMap<String, Application>,
    task: &TaskRef,
    env: SharedEnvironment,
    cancel: CancellationToken,
) -> Result<(), TaskFailure> {
    let (application, action) = resolve(applications, task)?;
    log::info!(
        "[{}:{}] starting '{}' in '{}'",
        task.name,
        task.action,
        action.command,
        application.path.display()
    );

    let request = ExecRequest {
        label: format!("{}:{}", task.name, task.action),
        invocation: Invocation::Command {
            program: action.command.clone(),
            args: action.args.clone(),
        },
        cwd: application.path.clone(),
        env,
        cancel,
    };
    backend.execute(request).await?;
    Ok(())
}

// src/core/report.rs

//! # Unit Errors
//!
//! Every concurrent unit (a repository target, a background task, a listener)
//! reports at most one [`UnitError`] into a bounded queue shared with its
//! orchestrator. The orchestrator owns the receiving end and decides what the
//! errors mean for the run as a whole.

use crate::{
    core::{
        launcher::TaskFailure,
        pipeline::ActionFailure,
        server::{Endpoint, ListenerError},
    },
    models::ActionKind,
};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum UnitError {
    #[error("[{target}] action '{action}' failed: {source}")]
    Action {
        target: String,
        action: ActionKind,
        #[source]
        source: ActionFailure,
    },
    #[error("[{application}:{action}] task failed: {source}")]
    Task {
        application: String,
        action: String,
        #[source]
        source: TaskFailure,
    },
    #[error("[{endpoint}] listener failed: {source}")]
    Listener {
        endpoint: Endpoint,
        #[source]
        source: ListenerError,
    },
    #[error("[{unit}] stopped unexpectedly: {reason}")]
    Crashed { unit: String, reason: String },
}

impl UnitError {
    /// The name of the unit that produced the error.
    pub fn unit(&self) -> String {
        match self {
            UnitError::Action { target, .. } => target.clone(),
            UnitError::Task {
                application,
                action,
                ..
            } => format!("{application}:{action}"),
            UnitError::Listener { endpoint, .. } => endpoint.to_string(),
            UnitError::Crashed { unit, .. } => unit.clone(),
        }
    }
}

pub type ErrorSender = mpsc::Sender<UnitError>;
pub type ErrorReceiver = mpsc::Receiver<UnitError>;

/// Creates the shared error queue sized for `producers` units.
///
/// Each unit reports at most once, so a capacity of one slot per producer means
/// reporting never waits on the consumer.
pub fn error_queue(producers: usize) -> (ErrorSender, ErrorReceiver) {
    mpsc::channel(producers.max(1))
}

/// Reports an error, logging instead when the orchestrator already went away.
pub async fn report(errors: &ErrorSender, error: UnitError) {
    log::debug!("Unit '{}' reported: {}", error.unit(), error);
    if let Err(mpsc::error::SendError(error)) = errors.send(error).await {
        log::warn!("Error reported after the run finished: {}", error);
    }
}

/// Collects every error still queued. Call after all senders have been dropped.
pub async fn drain(mut errors: ErrorReceiver) -> Vec<UnitError> {
    let mut collected = Vec::new();
    while let Some(error) = errors.recv().await {
        collected.push(error);
    }
    collected
}

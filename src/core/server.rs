//! # Serve Mode
//!
//! Listener startup and the controller that owns a serve run.
//!
//! The [`ServeController`] holds every long-lived unit (background tasks and the
//! HTTP/HTTPS listeners) in one `JoinSet` and watches for the first reason to
//! stop: an OS signal, a reported error, explicit cancellation, or every unit
//! finishing on its own. It then cancels the run, joins every unit and stops.

use crate::{
    CancellationToken,
    constants::SHUTDOWN_GRACE_PERIOD,
    core::{
        config_loader::{self, ConfigError},
        proxy::{self, RouteTable, Scheme},
        report::{self, ErrorReceiver, ErrorSender, UnitError},
    },
    models::{ServerConfig, SslConfig},
};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

// --- LISTENERS ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Http,
    Https,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Http => f.write_str("http"),
            Endpoint::Https => f.write_str("https"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not resolve listen address '{0}'")]
    Resolve(String),
    #[error("could not load TLS certificate or key: {0}")]
    Tls(#[source] std::io::Error),
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Handles to the listeners started by [`launch_listeners`].
#[derive(Debug)]
pub struct LaunchedListeners {
    /// Resolves to the bound HTTP address once the listener accepts connections.
    pub http_ready: oneshot::Receiver<SocketAddr>,
    /// Whether an HTTPS listener unit was started.
    pub https: bool,
}

/// Starts the HTTP listener, and the HTTPS listener when TLS is configured.
///
/// Each listener is its own unit on `units`. Failures (including missing TLS
/// material) are reported to `errors` and never affect the other listener. Both
/// stop gracefully once `cancel` fires.
pub fn launch_listeners(
    server: &ServerConfig,
    table: Arc<RouteTable>,
    client: reqwest::Client,
    units: &mut JoinSet<()>,
    errors: &ErrorSender,
    cancel: &CancellationToken,
) -> LaunchedListeners {
    let (ready_tx, http_ready) = oneshot::channel();

    let http_router = proxy::router(Arc::clone(&table), client.clone(), Scheme::Http);
    let host = server.host.clone();
    let port = server.port;
    let http_errors = errors.clone();
    let http_cancel = cancel.clone();
    units.spawn(async move {
        if let Err(source) = serve_http(&host, port, http_router, ready_tx, http_cancel).await {
            report::report(
                &http_errors,
                UnitError::Listener {
                    endpoint: Endpoint::Http,
                    source,
                },
            )
            .await;
        }
    });

    if !tls_requested(&server.ssl) {
        log::info!("No TLS configuration, HTTPS listener disabled.");
        return LaunchedListeners {
            http_ready,
            https: false,
        };
    }

    let https_router = proxy::router(table, client, Scheme::Https);
    let host = server.host.clone();
    let ssl = server.ssl.clone();
    let https_errors = errors.clone();
    let https_cancel = cancel.clone();
    units.spawn(async move {
        if let Err(source) = serve_https(&host, &ssl, https_router, https_cancel).await {
            report::report(
                &https_errors,
                UnitError::Listener {
                    endpoint: Endpoint::Https,
                    source,
                },
            )
            .await;
        }
    });

    LaunchedListeners {
        http_ready,
        https: true,
    }
}

/// TLS counts as requested once any `ssl` field is set.
fn tls_requested(ssl: &SslConfig) -> bool {
    ssl.port != 0 || !ssl.cert.trim().is_empty() || !ssl.key.trim().is_empty()
}

async fn serve_http(
    host: &str,
    port: u16,
    router: axum::Router,
    ready: oneshot::Sender<SocketAddr>,
    cancel: CancellationToken,
) -> Result<(), ListenerError> {
    let address = format!("{host}:{port}");
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|source| ListenerError::Bind {
            address: address.clone(),
            source,
        })?;
    let local = listener.local_addr().map_err(ListenerError::Serve)?;
    log::info!("Starting HTTP server at {}", local);
    ready.send(local).ok();

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
    .map_err(ListenerError::Serve)?;

    log::debug!("HTTP server at {} stopped.", address);
    Ok(())
}

async fn serve_https(
    host: &str,
    ssl: &SslConfig,
    router: axum::Router,
    cancel: CancellationToken,
) -> Result<(), ListenerError> {
    let (cert, key) = config_loader::tls_material(ssl)?;
    ensure_crypto_provider();
    let tls = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .map_err(ListenerError::Tls)?;

    let address = format!("{host}:{}", ssl.port);
    let bind_to = tokio::net::lookup_host((host, ssl.port))
        .await
        .map_err(|source| ListenerError::Bind {
            address: address.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| ListenerError::Resolve(address.clone()))?;

    let handle = Handle::new();
    log::info!("Starting HTTPS server at {}", bind_to);
    let serve = axum_server::bind_rustls(bind_to, tls)
        .handle(handle.clone())
        .serve(router.into_make_service_with_connect_info::<SocketAddr>());
    serve_until_cancelled(serve, &handle, &cancel)
        .await
        .map_err(ListenerError::Serve)?;

    log::debug!("HTTPS server at {} stopped.", address);
    Ok(())
}

/// Drives `serve` to completion, starting a graceful shutdown of `handle` once
/// `cancel` fires. Returns as soon as `serve` does, cancelled or not.
async fn serve_until_cancelled<F>(
    serve: F,
    handle: &Handle,
    cancel: &CancellationToken,
) -> std::io::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(serve);
    tokio::select! {
        result = &mut serve => return result,
        () = cancel.cancelled() => handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD)),
    }
    serve.await
}

/// Installs the process-wide rustls provider if nothing has yet.
pub fn ensure_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        // Losing a race with another installer is fine.
        rustls::crypto::ring::default_provider().install_default().ok();
    }
}

/// Resolves on SIGINT/Ctrl+C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// --- CONTROLLER ---

/// Lifecycle of a serve run. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServeState {
    Starting,
    Serving,
    ShuttingDown,
    Stopped,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("serve state cannot move from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: ServeState,
    pub to: ServeState,
}

/// What made the controller stop.
#[derive(Debug)]
pub enum ShutdownCause {
    Signal,
    Failure(UnitError),
    Cancelled,
    Completed,
}

#[derive(Debug)]
pub struct ServeOutcome {
    pub cause: ShutdownCause,
    /// Errors reported besides the one that triggered shutdown.
    pub errors: Vec<UnitError>,
    /// Every state the controller passed through, in order.
    pub history: Vec<ServeState>,
}

impl ServeOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self.cause, ShutdownCause::Failure(_)) && self.errors.is_empty()
    }
}

#[derive(Debug)]
pub struct ServeController {
    state: ServeState,
    history: Vec<ServeState>,
    cancel: CancellationToken,
    units: JoinSet<()>,
    sender: ErrorSender,
    receiver: ErrorReceiver,
}

impl ServeController {
    /// Creates a controller whose error queue has room for `producers` units.
    pub fn new(cancel: CancellationToken, producers: usize) -> Self {
        let (sender, receiver) = report::error_queue(producers);
        Self {
            state: ServeState::Starting,
            history: vec![ServeState::Starting],
            cancel,
            units: JoinSet::new(),
            sender,
            receiver,
        }
    }

    pub fn state(&self) -> ServeState {
        self.state
    }

    /// A sender for units to report into.
    pub fn errors(&self) -> ErrorSender {
        self.sender.clone()
    }

    pub fn units_mut(&mut self) -> &mut JoinSet<()> {
        &mut self.units
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Moves to `next`, rejecting anything that is not strictly forward.
    pub fn transition(&mut self, next: ServeState) -> Result<(), TransitionError> {
        if next <= self.state {
            let error = TransitionError {
                from: self.state,
                to: next,
            };
            log::warn!("Rejected transition: {}", error);
            return Err(error);
        }
        log::debug!("Serve state: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Marks the run as serving once every unit has been launched.
    pub fn begin_serving(&mut self) -> Result<(), TransitionError> {
        self.transition(ServeState::Serving)
    }

    /// Waits for the first shutdown reason, then stops every unit.
    pub async fn run<S>(mut self, shutdown: S) -> ServeOutcome
    where
        S: Future<Output = ()>,
    {
        if self.state == ServeState::Starting {
            self.begin_serving().ok();
        }

        let cause = self.wait_for_shutdown(shutdown).await;
        match &cause {
            ShutdownCause::Signal => log::info!("Shutdown signal received, stopping..."),
            ShutdownCause::Failure(e) => log::error!("Stopping after failure: {}", e),
            ShutdownCause::Cancelled => log::info!("Run cancelled, stopping..."),
            ShutdownCause::Completed => log::info!("All units finished."),
        }

        self.transition(ServeState::ShuttingDown).ok();
        self.cancel.cancel();
        let mut errors = self.join_all().await;

        let Self {
            sender,
            mut receiver,
            mut history,
            ..
        } = self;
        drop(sender);
        while let Some(error) = receiver.recv().await {
            errors.push(error);
        }

        log::debug!("Serve state: ShuttingDown -> Stopped");
        history.push(ServeState::Stopped);
        ServeOutcome {
            cause,
            errors,
            history,
        }
    }

    async fn wait_for_shutdown<S>(&mut self, shutdown: S) -> ShutdownCause
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            if self.units.is_empty() {
                return match self.receiver.try_recv() {
                    Ok(error) => ShutdownCause::Failure(error),
                    Err(_) => ShutdownCause::Completed,
                };
            }

            tokio::select! {
                _ = &mut shutdown => return ShutdownCause::Signal,
                Some(error) = self.receiver.recv() => return ShutdownCause::Failure(error),
                _ = self.cancel.cancelled() => return ShutdownCause::Cancelled,
                Some(joined) = self.units.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            return ShutdownCause::Failure(crashed(&e));
                        }
                    }
                }
            }
        }
    }

    /// Joins every unit, aborting stragglers after the grace period.
    async fn join_all(&mut self) -> Vec<UnitError> {
        let mut crashes = Vec::new();
        let units = &mut self.units;
        let joined = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD * 2, async {
            while let Some(result) = units.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        crashes.push(crashed(&e));
                    }
                }
            }
        })
        .await;

        if joined.is_err() {
            log::warn!(
                "{} unit(s) did not stop in time, aborting them.",
                self.units.len()
            );
            self.units.abort_all();
            while self.units.join_next().await.is_some() {}
        }
        crashes
    }
}

fn crashed(error: &tokio::task::JoinError) -> UnitError {
    UnitError::Crashed {
        unit: format!("task {}", error.id()),
        reason: error.to_string(),
    }
}

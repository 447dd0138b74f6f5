// src/cli/handlers/serve.rs

use crate::{
    CancellationToken,
    cli::handlers::commons,
    core::{
        config_loader,
        launcher::TaskLauncher,
        proxy::{self, RouteTable},
        server::{self, ServeController, ServeOutcome, ShutdownCause},
    },
    system::executor::ProcessBackend,
};
use anyhow::{Context, Result, anyhow};
use colored::Colorize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// Entry point for `serve --profile <name>`.
///
/// Everything that can be validated up front (profile, routes, route targets,
/// application paths) is checked before a single unit is launched.
pub async fn handle(
    config: Option<&Path>,
    profile_name: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let outcome = serve(config, profile_name, cancel, server::shutdown_signal()).await?;
    finish(outcome)
}

async fn serve<S>(
    config: Option<&Path>,
    profile_name: &str,
    cancel: CancellationToken,
    shutdown: S,
) -> Result<ServeOutcome>
where
    S: Future<Output = ()>,
{
    let config = commons::load_config(config)?;
    let profile = config_loader::select_profile(&config.server, profile_name)?.clone();
    let routes = config_loader::select_routes(&config.server, profile_name, &profile)?;
    let table = Arc::new(RouteTable::build(routes)?);
    let applications = config_loader::resolve_applications(&config)?;
    let client = proxy::client().context("Failed to build the upstream HTTP client")?;
    let env = commons::capture_environment(&config.versions).await?;

    println!(
        "{} profile '{}': {} task(s), {} route(s)",
        "Serving".green().bold(),
        profile_name.cyan(),
        profile.tasks.len(),
        table.routes().len()
    );

    let mut controller = ServeController::new(cancel.clone(), profile.tasks.len() + 2);
    let errors = controller.errors();

    let launcher = TaskLauncher::new(Arc::new(ProcessBackend), env, applications, cancel.clone());
    launcher.launch(&profile.tasks, controller.units_mut(), &errors);
    let listeners = server::launch_listeners(
        &config.server,
        table,
        client,
        controller.units_mut(),
        &errors,
        &cancel,
    );
    drop(errors);
    controller.begin_serving()?;

    tokio::spawn(async move {
        if let Ok(address) = listeners.http_ready.await {
            println!("{} http://{}", "Proxy listening on".green(), address);
        }
    });

    Ok(controller.run(shutdown).await)
}

fn finish(outcome: ServeOutcome) -> Result<()> {
    for error in &outcome.errors {
        eprintln!("{} {}", "✖".red().bold(), error.to_string().red());
    }

    match outcome.cause {
        ShutdownCause::Failure(error) => {
            Err(anyhow!(error).context("Serve stopped after a failure"))
        }
        _ if !outcome.errors.is_empty() => Err(anyhow!(
            "{} unit(s) failed while shutting down.",
            outcome.errors.len()
        )),
        _ => {
            println!("{}", "Stopped.".green());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config_loader::ConfigError;
    use std::io::Write;
    use std::time::Duration;

    fn config_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_unknown_profile_fails_before_launch() {
        let file = config_file("server:\n  profiles:\n    local: {}\n");
        let err = serve(
            Some(file.path()),
            "prod",
            CancellationToken::new(),
            std::future::pending(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownProfile { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_route_target_fails_before_launch() {
        let file = config_file(
            "server:\n  routes:\n    api: { source: /api/, target: 'not a url' }\n  profiles:\n    local: {}\n",
        );
        let err = serve(
            Some(file.path()),
            "local",
            CancellationToken::new(),
            std::future::pending(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidRouteTarget { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_application_stops_the_run() {
        let file = config_file(
            "server:\n  port: 0\n  profiles:\n    local:\n      tasks: [{ name: ghost, action: dev }]\n",
        );
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            serve(
                Some(file.path()),
                "local",
                CancellationToken::new(),
                std::future::pending(),
            ),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(outcome.cause, ShutdownCause::Failure(_)));
        assert!(finish(outcome).is_err());
    }

    #[tokio::test]
    async fn test_signal_shuts_down_cleanly() {
        let file = config_file("server:\n  port: 0\n  profiles:\n    local: {}\n");
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            serve(
                Some(file.path()),
                "local",
                CancellationToken::new(),
                tokio::time::sleep(Duration::from_millis(100)),
            ),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(outcome.cause, ShutdownCause::Signal));
        assert!(finish(outcome).is_ok());
    }
}

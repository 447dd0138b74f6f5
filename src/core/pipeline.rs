//! # Action Pipeline
//!
//! Runs the requested repository actions across every target concurrently.
//!
//! Each target is an independent unit: its actions run strictly in
//! fetch → clean → install → build order, and its first failure skips the rest
//! of *that* target only. Failures are reported through the shared error queue
//! and collected once every unit has finished.

use crate::{
    CancellationToken,
    core::{
        composer::{self, ComposeError},
        report::{self, ErrorSender, UnitError},
    },
    models::{ActionKind, Target, Versions},
    system::{
        environment::SharedEnvironment,
        executor::{ExecRequest, ExecutionBackend, ExecutionError, Invocation},
    },
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;

/// Why a single action of a target failed.
#[derive(Error, Debug)]
pub enum ActionFailure {
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Maps a command name to the actions it selects. `all` selects every action.
pub fn actions_for_command(command: &str) -> Option<Vec<ActionKind>> {
    match command {
        "all" => Some(ActionKind::ALL.to_vec()),
        other => ActionKind::from_name(other).map(|kind| vec![kind]),
    }
}

/// Puts the requested actions in execution order, dropping duplicates.
pub fn ordered(requested: &[ActionKind]) -> Vec<ActionKind> {
    ActionKind::ALL
        .into_iter()
        .filter(|kind| requested.contains(kind))
        .collect()
}

/// The outcome of a pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    /// Number of targets that were launched.
    pub targets: usize,
    /// One entry per failing target.
    pub failures: Vec<UnitError>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
pub struct ActionPipeline<B: ExecutionBackend> {
    backend: Arc<B>,
    env: SharedEnvironment,
    versions: Arc<Versions>,
    cancel: CancellationToken,
}

impl<B: ExecutionBackend> ActionPipeline<B> {
    pub fn new(
        backend: Arc<B>,
        env: SharedEnvironment,
        versions: Versions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            env,
            versions: Arc::new(versions),
            cancel,
        }
    }

    /// Runs `requested` against every target and waits for all of them.
    ///
    /// A target whose unit panics is reported as [`UnitError::Crashed`]. When the
    /// run is cancelled, units stop before their next action and do not report.
    pub async fn run(&self, requested: &[ActionKind], targets: &[Target]) -> PipelineReport {
        let actions = Arc::new(ordered(requested));
        let (errors, queue) = report::error_queue(targets.len());
        let mut units = JoinSet::new();
        let mut unit_names = HashMap::with_capacity(targets.len());

        log::debug!(
            "Launching {} target(s) for action(s): {:?}",
            targets.len(),
            actions
        );

        for target in targets {
            let unit = TargetUnit {
                backend: Arc::clone(&self.backend),
                env: self.env.clone(),
                versions: Arc::clone(&self.versions),
                cancel: self.cancel.clone(),
                target: target.clone(),
                actions: Arc::clone(&actions),
            };
            let errors = errors.clone();
            let handle = units.spawn(async move {
                if let Err(error) = unit.run().await {
                    report::report(&errors, error).await;
                }
            });
            unit_names.insert(handle.id(), target.name.clone());
        }

        while let Some(joined) = units.join_next_with_id().await {
            if let Err(join_error) = joined {
                let unit = unit_names
                    .get(&join_error.id())
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                report_crash(&errors, unit, join_error).await;
            }
        }

        drop(errors);
        PipelineReport {
            targets: targets.len(),
            failures: report::drain(queue).await,
        }
    }
}

async fn report_crash(errors: &ErrorSender, unit: String, join_error: tokio::task::JoinError) {
    if join_error.is_cancelled() {
        log::debug!("[{}] unit was aborted.", unit);
        return;
    }
    report::report(
        errors,
        UnitError::Crashed {
            unit,
            reason: join_error.to_string(),
        },
    )
    .await;
}

/// Everything one target needs to run its actions on its own task.
struct TargetUnit<B: ExecutionBackend> {
    backend: Arc<B>,
    env: SharedEnvironment,
    versions: Arc<Versions>,
    cancel: CancellationToken,
    target: Target,
    actions: Arc<Vec<ActionKind>>,
}

impl<B: ExecutionBackend> TargetUnit<B> {
    async fn run(self) -> Result<(), UnitError> {
        let name = self.target.name.as_str();

        for &kind in self.actions.iter() {
            if self.cancel.is_cancelled() {
                log::debug!("[{}] run cancelled before '{}'.", name, kind);
                return Ok(());
            }

            let context = composer::build_context(&self.target, kind, &self.versions);
            let script = composer::compose(kind, self.target.fragments(kind), &context)
                .map_err(|e| self.failure(kind, e.into()))?;

            if script.is_blank() {
                log::info!("[{}] no '{}' commands apply, skipping.", name, kind);
                continue;
            }

            log::info!("[{}] running '{}'...", name, kind);
            let request = ExecRequest {
                label: format!("{}:{}", name, kind),
                invocation: Invocation::Script(script.body),
                cwd: self.target.path.clone(),
                env: self.env.clone(),
                cancel: self.cancel.clone(),
            };

            match self.backend.execute(request).await {
                Ok(()) => log::debug!("[{}] '{}' finished.", name, kind),
                Err(ExecutionError::Cancelled) => {
                    log::warn!("[{}] '{}' was interrupted.", name, kind);
                    return Ok(());
                }
                Err(e) => return Err(self.failure(kind, e.into())),
            }
        }
        Ok(())
    }

    fn failure(&self, action: ActionKind, source: ActionFailure) -> UnitError {
        UnitError::Action {
            target: self.target.name.clone(),
            action,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConditionalFragment;
    use std::collections::{BTreeMap, HashSet};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
        fail: HashSet<String>,
        panic_on: HashSet<String>,
        scripts: Mutex<Vec<String>>,
    }

    impl RecordingBackend {
        fn failing(labels: &[&str]) -> Self {
            Self {
                fail: labels.iter().map(|l| l.to_string()).collect(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_for(&self, target: &str) -> Vec<String> {
            let prefix = format!("{}:", target);
            self.calls()
                .into_iter()
                .filter(|label| label.starts_with(&prefix))
                .collect()
        }
    }

    impl ExecutionBackend for RecordingBackend {
        async fn execute(&self, request: ExecRequest) -> Result<(), ExecutionError> {
            self.calls.lock().unwrap().push(request.label.clone());
            if let Invocation::Script(body) = &request.invocation {
                self.scripts.lock().unwrap().push(body.clone());
            }
            if self.panic_on.contains(&request.label) {
                panic!("backend exploded on {}", request.label);
            }
            if self.fail.contains(&request.label) {
                return Err(ExecutionError::CommandFailed(
                    request.label,
                    std::io::Error::other("boom"),
                ));
            }
            Ok(())
        }
    }

    fn target(name: &str) -> Target {
        Target {
            name: name.to_string(),
            path: PathBuf::from("/tmp").join(name),
            vars: BTreeMap::new(),
            actions: BTreeMap::new(),
        }
    }

    fn pipeline<B: ExecutionBackend>(backend: Arc<B>) -> ActionPipeline<B> {
        ActionPipeline::new(
            backend,
            SharedEnvironment::default(),
            Versions::default(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_actions_for_command() {
        assert_eq!(actions_for_command("all").unwrap(), ActionKind::ALL.to_vec());
        assert_eq!(
            actions_for_command("install").unwrap(),
            vec![ActionKind::Install]
        );
        assert!(actions_for_command("deploy").is_none());
    }

    #[test]
    fn test_ordered_ignores_request_order_and_duplicates() {
        let requested = [ActionKind::Build, ActionKind::Fetch, ActionKind::Build];
        assert_eq!(ordered(&requested), vec![ActionKind::Fetch, ActionKind::Build]);
    }

    #[tokio::test]
    async fn test_actions_run_in_fixed_order() {
        let backend = Arc::new(RecordingBackend::default());
        let report = pipeline(Arc::clone(&backend))
            .run(&[ActionKind::Build, ActionKind::Clean, ActionKind::Fetch], &[target("web")])
            .await;
        assert!(report.is_success());
        assert_eq!(backend.calls(), vec!["web:fetch", "web:clean", "web:build"]);
    }

    #[tokio::test]
    async fn test_failure_skips_rest_of_that_target_only() {
        let backend = Arc::new(RecordingBackend::failing(&["b:clean"]));
        let targets = [target("a"), target("b"), target("c")];
        let report = pipeline(Arc::clone(&backend))
            .run(&ActionKind::ALL, &targets)
            .await;

        assert_eq!(report.targets, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit(), "b");
        assert!(matches!(
            report.failures[0],
            UnitError::Action {
                action: ActionKind::Clean,
                source: ActionFailure::Execution(_),
                ..
            }
        ));
        assert_eq!(backend.calls_for("b"), vec!["b:fetch", "b:clean"]);
        assert_eq!(backend.calls_for("a").len(), 4);
        assert_eq!(backend.calls_for("c").len(), 4);
    }

    #[tokio::test]
    async fn test_every_failing_target_is_reported_once() {
        let backend = Arc::new(RecordingBackend::failing(&["a:fetch", "b:build", "c:install"]));
        let targets = [target("a"), target("b"), target("c"), target("d")];
        let report = pipeline(backend).run(&ActionKind::ALL, &targets).await;

        let mut units: Vec<String> = report.failures.iter().map(UnitError::unit).collect();
        units.sort();
        assert_eq!(units, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_malformed_condition_fails_closed() {
        let mut broken = target("api");
        broken.actions.insert(
            ActionKind::Install,
            vec![ConditionalFragment {
                value: "echo never\n".into(),
                condition: Some("projectName ==".into()),
            }],
        );
        let backend = Arc::new(RecordingBackend::default());
        let report = pipeline(Arc::clone(&backend))
            .run(&ActionKind::ALL, &[broken])
            .await;

        assert_eq!(backend.calls(), vec!["api:fetch", "api:clean"]);
        assert!(matches!(
            report.failures.as_slice(),
            [UnitError::Action {
                action: ActionKind::Install,
                source: ActionFailure::Compose(_),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_conditional_fragments_reach_the_backend() {
        let mut api = target("api");
        api.actions.insert(
            ActionKind::Build,
            vec![
                ConditionalFragment {
                    value: "a".into(),
                    condition: Some("projectName == 'api'".into()),
                },
                ConditionalFragment {
                    value: "b".into(),
                    condition: Some("projectName == 'web'".into()),
                },
            ],
        );
        let backend = Arc::new(RecordingBackend::default());
        pipeline(Arc::clone(&backend))
            .run(&[ActionKind::Build], &[api])
            .await;
        assert_eq!(*backend.scripts.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_blank_script_is_skipped_not_executed() {
        let mut quiet = target("quiet");
        quiet.actions.insert(
            ActionKind::Build,
            vec![ConditionalFragment {
                value: "echo nope\n".into(),
                condition: Some("projectName == 'other'".into()),
            }],
        );
        let backend = Arc::new(RecordingBackend::default());
        let report = pipeline(Arc::clone(&backend))
            .run(&[ActionKind::Fetch, ActionKind::Build], &[quiet])
            .await;
        assert!(report.is_success());
        assert_eq!(backend.calls(), vec!["quiet:fetch"]);
    }

    #[tokio::test]
    async fn test_panicking_unit_is_reported_as_crash() {
        let backend = Arc::new(RecordingBackend {
            panic_on: ["bad:fetch".to_string()].into_iter().collect(),
            ..Default::default()
        });
        let report = pipeline(Arc::clone(&backend))
            .run(&[ActionKind::Fetch], &[target("bad"), target("good")])
            .await;

        assert!(matches!(
            report.failures.as_slice(),
            [UnitError::Crashed { unit, .. }] if unit == "bad"
        ));
        assert_eq!(backend.calls_for("good"), vec!["good:fetch"]);
    }

    #[tokio::test]
    async fn test_no_targets_is_success() {
        let report = pipeline(Arc::new(RecordingBackend::default()))
            .run(&ActionKind::ALL, &[])
            .await;
        assert!(report.is_success());
        assert_eq!(report.targets, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let backend = Arc::new(RecordingBackend::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = ActionPipeline::new(
            Arc::clone(&backend),
            SharedEnvironment::default(),
            Versions::default(),
            cancel,
        );
        let report = pipeline.run(&ActionKind::ALL, &[target("a")]).await;
        assert!(report.is_success());
        assert!(backend.calls().is_empty());
    }

    struct BarrierBackend(Barrier);

    impl ExecutionBackend for BarrierBackend {
        async fn execute(&self, _request: ExecRequest) -> Result<(), ExecutionError> {
            self.0.wait().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_targets_run_concurrently() {
        // Every target must be inside the backend at once to pass the barrier.
        let backend = Arc::new(BarrierBackend(Barrier::new(3)));
        let targets = [target("a"), target("b"), target("c")];
        let pipeline = pipeline(backend);
        let run = pipeline.run(&[ActionKind::Fetch], &targets);
        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("targets did not run concurrently");
        assert!(report.is_success());
    }
}

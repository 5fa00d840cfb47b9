//! Per-resource reconciliation.
//!
//! This module implements the convergence loop for a single resource:
//! probe, compute the minimal actions, apply them, re-probe, and on a miss
//! perform exactly one retry pass before judging the outcome. Keys that hold
//! only eventually (ports, endpoints) are polled within a bounded window.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ProbeSettings;
use crate::control::{AgentControlPlane, HealthChecker, ObservedState, ResourceProbe};
use crate::desired::Resource;
use crate::error::{ActionError, ProbeError, Result};
use crate::planner::{
    Action, ActionExecutor, ActionKind, AttributeDiff, PassResult, PlanEntry, plan_actions,
    retry_actions,
};
use crate::report::{Outcome, OutcomeStatus};

/// Reconciles one resource at a time against the control plane.
#[derive(Debug, Clone)]
pub struct Reconciler {
    /// Read-only probe.
    probe: ResourceProbe,
    /// Action executor.
    executor: ActionExecutor,
    /// Timeouts and polling window.
    settings: ProbeSettings,
}

/// Result of reconciling one resource.
#[derive(Debug, Clone)]
pub struct ReconcileResult {
    /// Final outcome.
    pub outcome: Outcome,
    /// Whether any applied action changed the resource.
    pub changed: bool,
    /// Probe failure that produced the outcome, if any.
    pub probe_error: Option<ProbeError>,
}

impl Reconciler {
    /// Creates a reconciler over `plane`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client for endpoint checks cannot be built.
    pub fn new(plane: Arc<dyn AgentControlPlane>, settings: ProbeSettings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.timeout_secs);
        let health = HealthChecker::new(settings.timeout_secs)?;

        Ok(Self {
            probe: ResourceProbe::new(Arc::clone(&plane), health, timeout),
            executor: ActionExecutor::new(plane, timeout),
            settings,
        })
    }

    /// Converges `resource` toward its desired state.
    ///
    /// With `defer_if_changed`, eventual keys of a resource that changed are
    /// not awaited here; they are judged later, after coalesced restarts.
    pub async fn reconcile(&self, resource: &Resource, defer_if_changed: bool) -> ReconcileResult {
        info!("Reconciling {resource}");

        let observed = match self.probe.probe(resource).await {
            Ok(observed) => observed,
            Err(e) => return probe_failed(resource, e, Vec::new(), false),
        };

        let actions = plan_actions(resource, &observed);
        if actions.is_empty() {
            debug!("{resource}: no actions required");
        } else {
            info!("{resource}: {}", describe(&actions));
        }

        let first = self.executor.execute_all(&actions, resource).await;
        let mut applied = names(&first.applied);
        let mut changed = first.applied.iter().any(Action::is_change);

        let (observed, diff) = match self.settle(resource, defer_if_changed && changed).await {
            Ok(settled) => settled,
            Err(e) => return probe_failed(resource, e, applied, changed),
        };

        if first.error.is_none() && diff.is_converged() {
            let detail = if actions.is_empty() {
                "already converged"
            } else {
                "converged"
            };
            return ReconcileResult {
                outcome: judged(resource, &diff, detail).with_actions(applied),
                changed,
                probe_error: None,
            };
        }

        // one bounded retry
        let retry = retry_actions(resource, &observed);
        warn!(
            "{resource} did not converge ({}), retrying with: {}",
            failure_reason(&first, &diff),
            describe(&retry)
        );

        let second = self.executor.execute_all(&retry, resource).await;
        applied.extend(names(&second.applied));
        changed |= second.applied.iter().any(Action::is_change);

        let diff = match self.settle(resource, defer_if_changed && changed).await {
            Ok((_, diff)) => diff,
            Err(e) => return probe_failed(resource, e, applied, changed),
        };

        let outcome = if second.error.is_none() && diff.is_converged() {
            info!("{resource} converged on retry");
            Outcome::new(
                &resource.name,
                resource.kind,
                OutcomeStatus::Warn,
                "converged on retry",
            )
        } else {
            let reason = failure_reason(&second, &diff);
            warn!("{resource} failed to converge: {reason}");
            Outcome::new(&resource.name, resource.kind, OutcomeStatus::Fail, reason)
        };

        ReconcileResult {
            outcome: outcome.with_actions(applied),
            changed,
            probe_error: None,
        }
    }

    /// Probes `resource` and judges it without mutating anything.
    ///
    /// Eventual keys are polled within the configured window.
    pub async fn check(&self, resource: &Resource) -> ReconcileResult {
        debug!("Checking {resource}");

        match self.settle(resource, false).await {
            Ok((_, diff)) if diff.is_converged() => ReconcileResult {
                outcome: judged(resource, &diff, "converged"),
                changed: false,
                probe_error: None,
            },
            Ok((_, diff)) => ReconcileResult {
                outcome: Outcome::new(
                    &resource.name,
                    resource.kind,
                    OutcomeStatus::Fail,
                    diff.summary(),
                ),
                changed: false,
                probe_error: None,
            },
            Err(e) => probe_failed(resource, e, Vec::new(), false),
        }
    }

    /// Restarts a service once on behalf of the resources that notified it.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] if the restart fails.
    pub async fn restart(&self, service: &Resource) -> std::result::Result<(), ActionError> {
        let action = Action::new(ActionKind::Restart, service);
        self.executor.execute(&action, service).await
    }

    /// Computes what reconciling `resource` would do right now.
    pub async fn preview(&self, resource: &Resource) -> PlanEntry {
        let mut entry = PlanEntry {
            resource: resource.name.clone(),
            kind: resource.kind,
            mismatches: Vec::new(),
            unobservable: Vec::new(),
            actions: Vec::new(),
            error: None,
        };

        match self.probe.probe(resource).await {
            Ok(observed) => {
                let diff = AttributeDiff::compute(resource, &observed);
                entry.actions = plan_actions(resource, &observed);
                entry.mismatches = diff.mismatches;
                entry.unobservable = diff.unobservable;
            }
            Err(e) => entry.error = Some(e.to_string()),
        }

        entry
    }

    /// Re-probes until only eventual keys are left waiting, or the polling
    /// window closes.
    async fn settle(
        &self,
        resource: &Resource,
        defer_eventual: bool,
    ) -> std::result::Result<(ObservedState, AttributeDiff), ProbeError> {
        let interval = Duration::from_secs(self.settings.poll_interval_secs);
        let mut attempt = 1;

        loop {
            let observed = self.probe.probe(resource).await?;
            let diff = AttributeDiff::compute(resource, &observed);

            if defer_eventual {
                return Ok((observed, diff.without_eventual()));
            }
            if !diff.only_eventual() || attempt >= self.settings.poll_attempts {
                return Ok((observed, diff));
            }

            debug!(
                "{resource}: waiting for {} (attempt {attempt}/{})",
                diff.summary(),
                self.settings.poll_attempts
            );
            attempt += 1;
            tokio::time::sleep(interval).await;
        }
    }
}

/// PASS, or WARN when some declared keys cannot be observed.
fn judged(resource: &Resource, diff: &AttributeDiff, detail: &str) -> Outcome {
    if diff.unobservable.is_empty() {
        Outcome::new(&resource.name, resource.kind, OutcomeStatus::Pass, detail)
    } else {
        Outcome::new(
            &resource.name,
            resource.kind,
            OutcomeStatus::Warn,
            format!("{detail}; cannot observe: {}", diff.unobservable.join(", ")),
        )
    }
}

fn probe_failed(
    resource: &Resource,
    err: ProbeError,
    applied: Vec<String>,
    changed: bool,
) -> ReconcileResult {
    warn!("Probe of {resource} failed: {err}");

    let mut outcome = Outcome::new(
        &resource.name,
        resource.kind,
        OutcomeStatus::Fail,
        format!("probe failed: {err}"),
    )
    .with_actions(applied);
    outcome.probe_error = Some(err.kind());

    ReconcileResult {
        outcome,
        changed,
        probe_error: Some(err),
    }
}

fn failure_reason(pass: &PassResult, diff: &AttributeDiff) -> String {
    match &pass.error {
        Some(e) => e.to_string(),
        None => diff.summary(),
    }
}

fn names(actions: &[Action]) -> Vec<String> {
    actions.iter().map(ToString::to_string).collect()
}

fn describe(actions: &[Action]) -> String {
    if actions.is_empty() {
        String::from("nothing")
    } else {
        names(actions).join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::control::fake::FakeControlPlane;
    use crate::desired::DesiredStateStore;
    use crate::error::{ControlError, ProbeErrorKind};
    use std::path::Path;

    const DECLARATION: &str = r#"
target: {name: srv, home: /opt/srv}
probe: {timeout_secs: 5, poll_attempts: 3, poll_interval_secs: 0}
resources:
  - kind: service
    name: core
    desired: {installed: true, running: true}
  - kind: index
    name: main
    desired: {present: true}
    depends_on: [core]
  - kind: input
    name: tcp-9997
    file: inputs.conf
    content: "[tcp://9997]"
    desired: {present: true, port: 9997}
  - kind: service
    name: web
    desired: {running: true, port: 8000}
  - kind: service
    name: idle
    desired: {installed: true, port: 9998, endpoint: "http://127.0.0.1:1/"}
  - kind: index
    name: metrics
    desired: {present: true, maxDataSize: auto_high_volume}
"#;

    fn store() -> DesiredStateStore {
        let decl = ConfigParser::new()
            .parse_yaml(DECLARATION, None)
            .expect("valid yaml");
        DesiredStateStore::from_declaration(decl, Path::new(".")).expect("store")
    }

    fn reconciler(fake: &Arc<FakeControlPlane>) -> Reconciler {
        let plane: Arc<dyn AgentControlPlane> = fake.clone();
        Reconciler::new(plane, *store().probe_settings()).expect("reconciler")
    }

    fn resource(name: &str) -> Resource {
        store().get(name).cloned().expect("declared")
    }

    #[tokio::test]
    async fn test_fresh_service_installs_and_starts() {
        let fake = Arc::new(FakeControlPlane::new());
        let result = reconciler(&fake).reconcile(&resource("core"), false).await;

        assert_eq!(result.outcome.status, OutcomeStatus::Pass);
        assert_eq!(result.outcome.actions, vec!["install(core)", "start(core)"]);
        assert!(result.changed);
        assert_eq!(fake.actions(), vec!["install", "start"]);
    }

    #[tokio::test]
    async fn test_converged_resource_applies_nothing() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.set_installed(true);
        fake.set_running(true);

        let result = reconciler(&fake).reconcile(&resource("core"), false).await;

        assert_eq!(result.outcome.status, OutcomeStatus::Pass);
        assert_eq!(result.outcome.detail, "already converged");
        assert!(!result.changed);
        assert!(fake.actions().is_empty());
    }

    #[tokio::test]
    async fn test_converges_on_retry_with_warning() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.set_installed(true);
        fake.ineffective("start", 1);

        let result = reconciler(&fake).reconcile(&resource("core"), false).await;

        assert_eq!(result.outcome.status, OutcomeStatus::Warn);
        assert_eq!(result.outcome.detail, "converged on retry");
        assert_eq!(fake.actions(), vec!["start", "start"]);
        assert!(fake.status_now().running);
    }

    #[tokio::test]
    async fn test_fails_after_single_retry() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.set_installed(true);
        fake.ineffective("start", 10);

        let result = reconciler(&fake).reconcile(&resource("core"), false).await;

        assert_eq!(result.outcome.status, OutcomeStatus::Fail);
        assert_eq!(result.outcome.detail, "running: want true, got false");
        assert_eq!(fake.actions().len(), 2);
    }

    #[tokio::test]
    async fn test_action_error_is_retried() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.fail_next(
            "install",
            ControlError::CommandFailed {
                operation: String::from("install"),
                code: Some(100),
                stderr: String::from("dpkg lock held"),
            },
        );

        let result = reconciler(&fake).reconcile(&resource("core"), false).await;

        assert_eq!(result.outcome.status, OutcomeStatus::Warn);
        assert_eq!(fake.actions(), vec!["install", "install", "start"]);
    }

    #[tokio::test]
    async fn test_persistent_action_error_is_reported() {
        let fake = Arc::new(FakeControlPlane::new());
        for _ in 0..2 {
            fake.fail_next(
                "install",
                ControlError::CommandFailed {
                    operation: String::from("install"),
                    code: Some(100),
                    stderr: String::from("dpkg lock held"),
                },
            );
        }

        let result = reconciler(&fake).reconcile(&resource("core"), false).await;

        assert_eq!(result.outcome.status, OutcomeStatus::Fail);
        assert!(result.outcome.detail.contains("dpkg lock held"));
        assert!(result.outcome.actions.is_empty());
    }

    #[tokio::test]
    async fn test_probe_error_is_fail_not_absent() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.set_unreachable(true);

        let result = reconciler(&fake).reconcile(&resource("main"), false).await;

        assert_eq!(result.outcome.status, OutcomeStatus::Fail);
        assert_eq!(result.outcome.probe_error, Some(ProbeErrorKind::Unreachable));
        assert!(matches!(result.probe_error, Some(ProbeError::Unreachable { .. })));
        assert!(fake.actions().is_empty());
    }

    #[tokio::test]
    async fn test_port_is_polled_then_fails() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.set_installed(true);
        fake.set_running(true);

        let result = reconciler(&fake).reconcile(&resource("web"), false).await;

        assert_eq!(result.outcome.status, OutcomeStatus::Fail);
        assert!(result.outcome.detail.contains("port"));
    }

    #[tokio::test]
    async fn test_port_opens_once_service_runs() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.set_installed(true);
        fake.serve_while_running(8000);

        let result = reconciler(&fake).reconcile(&resource("web"), false).await;

        assert_eq!(result.outcome.status, OutcomeStatus::Pass);
        assert_eq!(fake.actions(), vec!["start"]);
    }

    #[tokio::test]
    async fn test_port_and_endpoint_checked_without_running_flag() {
        let fake = Arc::new(FakeControlPlane::new());

        let result = reconciler(&fake).reconcile(&resource("idle"), false).await;

        assert_eq!(result.outcome.status, OutcomeStatus::Fail);
        assert!(result.outcome.detail.contains("port: want 9998"));
        assert!(result.outcome.detail.contains("endpoint"));
        assert_eq!(fake.actions(), vec!["install"]);
    }

    #[tokio::test]
    async fn test_index_params_are_reported_as_unverified() {
        let fake = Arc::new(FakeControlPlane::new());
        let metrics = resource("metrics");

        let created = reconciler(&fake).reconcile(&metrics, false).await;
        assert_eq!(created.outcome.status, OutcomeStatus::Warn);
        assert_eq!(fake.actions(), vec!["create_index(metrics)"]);

        let again = reconciler(&fake).reconcile(&metrics, false).await;
        assert_eq!(again.outcome.status, OutcomeStatus::Warn);
        assert_eq!(
            again.outcome.detail,
            "already converged; cannot observe: maxDataSize"
        );
        assert_eq!(fake.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_notifier_defers_port() {
        let fake = Arc::new(FakeControlPlane::new());
        let input = resource("tcp-9997");

        let deferred = reconciler(&fake).reconcile(&input, true).await;
        assert_eq!(deferred.outcome.status, OutcomeStatus::Pass);
        assert!(deferred.changed);
        assert_eq!(fake.config("inputs.conf").as_deref(), Some(b"[tcp://9997]".as_slice()));

        let checked = reconciler(&fake).check(&input).await;
        assert_eq!(checked.outcome.status, OutcomeStatus::Fail);

        fake.listen_on(9997);
        let checked = reconciler(&fake).check(&input).await;
        assert_eq!(checked.outcome.status, OutcomeStatus::Pass);
    }

    #[tokio::test]
    async fn test_preview_does_not_mutate() {
        let fake = Arc::new(FakeControlPlane::new());

        let entry = reconciler(&fake).preview(&resource("core")).await;

        assert_eq!(entry.actions.len(), 2);
        assert_eq!(entry.mismatches.len(), 2);
        assert!(fake.actions().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_converges_to_absent() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.set_installed(true);
        fake.set_running(true);

        let result = reconciler(&fake)
            .reconcile(&resource("core").to_absent(), false)
            .await;

        assert_eq!(result.outcome.status, OutcomeStatus::Pass);
        assert_eq!(fake.actions(), vec!["stop", "uninstall"]);
        assert!(!fake.status_now().installed);
    }
}

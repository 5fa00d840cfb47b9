//! Run orchestration.
//!
//! Drives one run against a target:
//! `INIT -> LOADING_DESIRED_STATE -> RECONCILING(r1) -> ... -> VERIFYING -> COMPLETED`,
//! or `ABORTED` on an unrecoverable error. Applied actions are never rolled
//! back; recovery is another run.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::control::AgentControlPlane;
use crate::desired::{DesiredStateStore, Resource};
use crate::error::{DependencyError, ProbeError, ReconcileError, Result};
use crate::planner::Plan;
use crate::reconciler::Reconciler;
use crate::report::{
    LOCK_REFRESH_SECS, LockInfo, Outcome, OutcomeStatus, Report, ReportStore, RunMode, RunPhase,
    generate_holder_id,
};

/// Runs apply, verify and teardown against one target.
pub struct Orchestrator {
    /// Desired state for the run.
    store: DesiredStateStore,
    /// Per-resource reconciler.
    reconciler: Reconciler,
    /// Where the last report and the run lock live.
    reports: Option<Box<dyn ReportStore>>,
    /// Lock holder identifier.
    holder: String,
    /// How often the held run lock is renewed.
    lock_refresh: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("target", &self.store.target().name)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator for `store` over `plane`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reconciler cannot be built.
    pub fn new(store: DesiredStateStore, plane: Arc<dyn AgentControlPlane>) -> Result<Self> {
        let reconciler = Reconciler::new(plane, *store.probe_settings())?;

        Ok(Self {
            store,
            reconciler,
            reports: None,
            holder: generate_holder_id(),
            lock_refresh: Duration::from_secs(LOCK_REFRESH_SECS),
        })
    }

    /// Persists reports and takes the run lock through `reports`.
    #[must_use]
    pub fn with_report_store(mut self, reports: Box<dyn ReportStore>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Sets the lock holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Sets how often the run lock is renewed while a run holds it.
    ///
    /// A zero interval is ignored.
    #[must_use]
    pub fn with_lock_refresh(mut self, every: Duration) -> Self {
        if !every.is_zero() {
            self.lock_refresh = every;
        }
        self
    }

    /// Returns the desired state.
    #[must_use]
    pub const fn store(&self) -> &DesiredStateStore {
        &self.store
    }

    /// Converges every resource to its declared state.
    ///
    /// # Errors
    ///
    /// Returns an error if the run lock cannot be acquired.
    pub async fn apply(&self) -> Result<Report> {
        self.run(RunMode::Apply).await
    }

    /// Probes every resource and reports, without mutating anything.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature matches the other modes.
    pub async fn verify(&self) -> Result<Report> {
        self.run(RunMode::Verify).await
    }

    /// Converges every resource to absent, in reverse dependency order.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::TeardownNotConfirmed`] unless `confirmed`,
    /// or an error if the run lock cannot be acquired.
    pub async fn teardown(&self, confirmed: bool) -> Result<Report> {
        if !confirmed {
            return Err(ReconcileError::TeardownNotConfirmed {
                target: self.store.target().name.clone(),
            }
            .into());
        }
        self.run(RunMode::Teardown).await
    }

    /// Computes the actions an apply (or teardown) would take right now.
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the graph is cyclic.
    pub async fn plan(&self, teardown: bool) -> Result<Plan> {
        let resources = self.ordered(teardown)?;
        let mut plan = Plan::new(
            &self.store.target().name,
            self.store.declaration_hash(),
            teardown,
        );

        for resource in &resources {
            plan.entries.push(self.reconciler.preview(resource).await);
        }

        info!(
            "Plan for {}: {} actions over {} resources",
            plan.target,
            plan.action_count(),
            plan.entries.len()
        );
        Ok(plan)
    }

    /// Resources in run order, mapped to absent for teardown.
    fn ordered(&self, teardown: bool) -> std::result::Result<Vec<Resource>, DependencyError> {
        let order = self.store.apply_order()?;
        Ok(if teardown {
            order.into_iter().rev().map(Resource::to_absent).collect()
        } else {
            order.into_iter().cloned().collect()
        })
    }

    async fn run(&self, mode: RunMode) -> Result<Report> {
        let target = &self.store.target().name;
        let mut report = Report::new(mode, target, self.store.declaration_hash());
        info!("Starting {mode} run {} on {target}", report.run_id);

        report.phase = RunPhase::LoadingDesiredState;
        let resources = match self.ordered(mode == RunMode::Teardown) {
            Ok(resources) => resources,
            Err(e) => {
                error!("{e}");
                abort(&mut report, self.store.resources(), &e.to_string());
                self.save(&report).await;
                return Ok(report);
            }
        };

        let lock = self.lock(mode).await?;

        let work = self.execute(&mut report, &resources, mode);
        match &lock {
            Some(held) => self.holding(held, work).await,
            None => work.await,
        }

        if !report.is_aborted() {
            report.complete();
        }

        let summary = report.summary();
        info!(
            "{mode} run ended in {}: {} pass, {} warn, {} fail ({} skipped)",
            report.phase, summary.pass, summary.warn, summary.fail, summary.skipped
        );

        self.unlock(lock).await;
        self.save(&report).await;
        Ok(report)
    }

    async fn execute(&self, report: &mut Report, resources: &[Resource], mode: RunMode) {
        if mode == RunMode::Verify {
            self.verify_all(report, resources).await;
        } else {
            self.converge(report, resources, mode).await;
            if !report.is_aborted() {
                self.verify_converged(report, resources).await;
            }
        }
    }

    /// Drives `work` to completion, renewing `lock` every refresh interval.
    async fn holding(&self, lock: &LockInfo, work: impl Future<Output = ()>) {
        let Some(reports) = &self.reports else {
            work.await;
            return;
        };

        tokio::pin!(work);
        let mut renew = tokio::time::interval(self.lock_refresh);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately
        renew.tick().await;

        loop {
            tokio::select! {
                () = &mut work => return,
                _ = renew.tick() => match reports.refresh_lock(lock).await {
                    Ok(renewed) => debug!("Run lock held until {}", renewed.expires_at),
                    Err(e) => warn!("Failed to renew run lock: {e}"),
                },
            }
        }
    }

    /// Reconciles each resource in order, skipping those whose blockers failed.
    async fn converge(&self, report: &mut Report, resources: &[Resource], mode: RunMode) {
        let teardown = mode == RunMode::Teardown;
        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut notified: Vec<String> = Vec::new();

        for (i, resource) in resources.iter().enumerate() {
            let blockers = self.blockers(resource, teardown);
            if let Some(blocker) = blockers.iter().find(|b| failed.contains(*b)) {
                warn!("Skipping {resource}: blocked by '{blocker}'");
                report.push(Outcome::skipped(&resource.name, resource.kind, blocker));
                failed.insert(resource.name.clone());
                continue;
            }

            report.phase = RunPhase::Reconciling(resource.name.clone());
            let result = self
                .reconciler
                .reconcile(resource, !resource.notify.is_empty())
                .await;

            if result.changed {
                for service in &resource.notify {
                    if !notified.contains(service) {
                        notified.push(service.clone());
                    }
                }
            }
            if !result.outcome.is_ok() {
                failed.insert(resource.name.clone());
            }
            report.push(result.outcome);

            if let Some(ProbeError::Unreachable { .. }) = &result.probe_error {
                let waiting = resources[i + 1..]
                    .iter()
                    .any(|r| self.blockers(r, teardown).contains(&resource.name));
                if waiting {
                    let reason = format!(
                        "control plane unreachable while probing required resource '{}'",
                        resource.name
                    );
                    error!("{reason}");
                    abort(report, &resources[i + 1..], &reason);
                    return;
                }
            }
        }

        self.restart_notified(report, &notified).await;
    }

    /// Restarts each notified service once, after the whole pass.
    async fn restart_notified(&self, report: &mut Report, notified: &[String]) {
        for name in notified {
            let Some(service) = self.store.get(name) else {
                warn!("Notified resource '{name}' is not declared");
                continue;
            };
            if service.wants_running() != Some(true) {
                debug!("Not restarting {service}: not desired running");
                continue;
            }
            if report.outcome(name).is_some_and(|o| !o.is_ok()) {
                debug!("Not restarting {service}: it did not converge");
                continue;
            }

            info!("Restarting {service} for notifying resources");
            match self.reconciler.restart(service).await {
                Ok(()) => report.restarts.push(name.clone()),
                Err(e) => {
                    error!("{e}");
                    if let Some(outcome) = report.outcome_mut(name) {
                        outcome.status = OutcomeStatus::Fail;
                        outcome.detail = format!("notified restart failed: {e}");
                    }
                }
            }
        }
    }

    /// Re-probes every resource that converged and downgrades drift to FAIL.
    async fn verify_converged(&self, report: &mut Report, resources: &[Resource]) {
        report.phase = RunPhase::Verifying;

        for resource in resources {
            if !report.outcome(&resource.name).is_some_and(Outcome::is_ok) {
                continue;
            }

            let check = self.reconciler.check(resource).await;
            if check.outcome.is_ok() {
                continue;
            }

            warn!("{resource} drifted after convergence: {}", check.outcome.detail);
            if let Some(outcome) = report.outcome_mut(&resource.name) {
                outcome.status = OutcomeStatus::Fail;
                outcome.detail = format!("drifted after convergence: {}", check.outcome.detail);
                outcome.probe_error = check.outcome.probe_error;
            }
        }
    }

    /// Probe-only run: every resource is checked, dependents of failures skipped.
    async fn verify_all(&self, report: &mut Report, resources: &[Resource]) {
        report.phase = RunPhase::Verifying;
        let mut failed: BTreeSet<String> = BTreeSet::new();

        for resource in resources {
            if let Some(blocker) = resource.depends_on.iter().find(|d| failed.contains(*d)) {
                report.push(Outcome::skipped(&resource.name, resource.kind, blocker));
                failed.insert(resource.name.clone());
                continue;
            }

            let check = self.reconciler.check(resource).await;
            if !check.outcome.is_ok() {
                failed.insert(resource.name.clone());
            }
            report.push(check.outcome);
        }
    }

    /// Names that must have converged before `resource` is touched.
    fn blockers(&self, resource: &Resource, teardown: bool) -> Vec<String> {
        if teardown {
            self.store
                .dependents_of(&resource.name)
                .into_iter()
                .map(String::from)
                .collect()
        } else {
            resource.depends_on.clone()
        }
    }

    async fn lock(&self, mode: RunMode) -> Result<Option<LockInfo>> {
        match &self.reports {
            Some(reports) if mode != RunMode::Verify => {
                let lock = reports
                    .acquire_lock(&self.holder, &self.store.target().name)
                    .await?;
                Ok(Some(lock))
            }
            _ => Ok(None),
        }
    }

    async fn unlock(&self, lock: Option<LockInfo>) {
        if let (Some(reports), Some(lock)) = (&self.reports, lock) {
            if let Err(e) = reports.release_lock(&lock.lock_id).await {
                error!("Failed to release run lock: {e}");
            }
        }
    }

    async fn save(&self, report: &Report) {
        if let Some(reports) = &self.reports {
            if let Err(e) = reports.save(report).await {
                warn!("Failed to persist report: {e}");
            }
        }
    }
}

/// Marks the run aborted and gives every remaining resource a FAIL outcome.
fn abort(report: &mut Report, remaining: &[Resource], reason: &str) {
    for resource in remaining {
        if report.outcome(&resource.name).is_none() {
            report.push(Outcome::new(
                &resource.name,
                resource.kind,
                OutcomeStatus::Fail,
                format!("run aborted: {reason}"),
            ));
        }
    }
    report.abort(reason);
}

//! Outcome and report types.
//!
//! A [`Report`] aggregates one [`Outcome`] per resource and maps the run to a
//! process exit code.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ResourceKind;
use crate::error::ProbeErrorKind;

/// Current version of the report format.
pub const REPORT_VERSION: &str = "1.0";

/// Final status of one resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeStatus {
    /// Every desired key holds.
    Pass,
    /// Desired keys hold, with a caveat.
    Warn,
    /// Some desired key does not hold.
    Fail,
}

/// Per-resource result of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Outcome {
    /// Resource name.
    pub resource: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Final status.
    pub status: OutcomeStatus,
    /// Human-readable reason.
    pub detail: String,
    /// Actions applied, in order.
    #[serde(default)]
    pub actions: Vec<String>,
    /// True if the resource was never reconciled because a dependency failed.
    #[serde(default)]
    pub skipped: bool,
    /// Kind of probe failure, if one caused this outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_error: Option<ProbeErrorKind>,
}

/// What a run converges toward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Converge to the declared state.
    Apply,
    /// Probe and compare only.
    Verify,
    /// Converge every resource to absent, in reverse order.
    Teardown,
}

/// Phase of the run state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Run created.
    Init,
    /// Desired state being loaded and ordered.
    LoadingDesiredState,
    /// Reconciling the named resource.
    Reconciling(String),
    /// Re-probing converged resources.
    Verifying,
    /// Run finished.
    Completed,
    /// Run stopped early.
    Aborted,
}

/// Outcome counts.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Summary {
    /// Resources that passed.
    pub pass: usize,
    /// Resources that passed with a warning.
    pub warn: usize,
    /// Resources that failed, skipped ones included.
    pub fail: usize,
    /// Resources skipped because a dependency failed.
    pub skipped: usize,
}

/// Result of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Report format version.
    pub version: String,
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Run mode.
    pub mode: RunMode,
    /// Target name.
    pub target: String,
    /// Hash of the declaration.
    pub declaration_hash: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last phase reached.
    pub phase: RunPhase,
    /// Why the run was aborted.
    #[serde(default)]
    pub abort_reason: Option<String>,
    /// Services restarted at the end of the pass.
    #[serde(default)]
    pub restarts: Vec<String>,
    /// One outcome per resource, in reconciliation order.
    pub outcomes: Vec<Outcome>,
}

impl Outcome {
    /// Creates an outcome.
    #[must_use]
    pub fn new(
        resource: &str,
        kind: ResourceKind,
        status: OutcomeStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.to_string(),
            kind,
            status,
            detail: detail.into(),
            actions: Vec::new(),
            skipped: false,
            probe_error: None,
        }
    }

    /// Creates a FAIL outcome for a resource blocked by `dependency`.
    #[must_use]
    pub fn skipped(resource: &str, kind: ResourceKind, dependency: &str) -> Self {
        Self {
            skipped: true,
            ..Self::new(
                resource,
                kind,
                OutcomeStatus::Fail,
                format!("skipped: blocked by dependency '{dependency}'"),
            )
        }
    }

    /// Attaches the applied actions.
    #[must_use]
    pub fn with_actions(mut self, actions: Vec<String>) -> Self {
        self.actions = actions;
        self
    }

    /// Returns true if the resource ended PASS or WARN.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status != OutcomeStatus::Fail
    }
}

impl Report {
    /// Creates a report for a run that is starting now.
    #[must_use]
    pub fn new(mode: RunMode, target: &str, declaration_hash: &str) -> Self {
        Self {
            version: REPORT_VERSION.to_string(),
            run_id: Uuid::new_v4(),
            mode,
            target: target.to_string(),
            declaration_hash: declaration_hash.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            phase: RunPhase::Init,
            abort_reason: None,
            restarts: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    /// Appends an outcome.
    pub fn push(&mut self, outcome: Outcome) {
        self.outcomes.push(outcome);
    }

    /// Returns the outcome for `resource`.
    #[must_use]
    pub fn outcome(&self, resource: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.resource == resource)
    }

    /// Returns the outcome for `resource` for modification.
    pub fn outcome_mut(&mut self, resource: &str) -> Option<&mut Outcome> {
        self.outcomes.iter_mut().find(|o| o.resource == resource)
    }

    /// Marks the run completed.
    pub fn complete(&mut self) {
        self.phase = RunPhase::Completed;
        self.finished_at = Some(Utc::now());
    }

    /// Marks the run aborted.
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.phase = RunPhase::Aborted;
        self.abort_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }

    /// Returns true if the run was aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.phase == RunPhase::Aborted
    }

    /// Counts outcomes by status.
    #[must_use]
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for outcome in &self.outcomes {
            match outcome.status {
                OutcomeStatus::Pass => summary.pass += 1,
                OutcomeStatus::Warn => summary.warn += 1,
                OutcomeStatus::Fail => summary.fail += 1,
            }
            if outcome.skipped {
                summary.skipped += 1;
            }
        }
        summary
    }

    /// Returns the worst status in the report.
    #[must_use]
    pub fn overall(&self) -> OutcomeStatus {
        if self.is_aborted() {
            return OutcomeStatus::Fail;
        }
        self.outcomes
            .iter()
            .map(|o| o.status)
            .max()
            .unwrap_or(OutcomeStatus::Pass)
    }

    /// Returns the process exit code: 0 all PASS, 1 any WARN and no FAIL,
    /// 2 any FAIL.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self.overall() {
            OutcomeStatus::Pass => 0,
            OutcomeStatus::Warn => 1,
            OutcomeStatus::Fail => 2,
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Apply => "apply",
            Self::Verify => "verify",
            Self::Teardown => "teardown",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::LoadingDesiredState => write!(f, "LOADING_DESIRED_STATE"),
            Self::Reconciling(resource) => write!(f, "RECONCILING({resource})"),
            Self::Verifying => write!(f, "VERIFYING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}/{}: {}", self.status, self.kind, self.resource, self.detail)
    }
}

//! Dry-run plans.
//!
//! A plan records, per resource in reconciliation order, what differs and
//! which actions an apply would take right now. Nothing is applied.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ResourceKind;

use super::action::{Action, ActionKind};
use super::diff::Mismatch;

/// A complete dry-run plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Target name.
    pub target: String,
    /// Hash of the declaration the plan is based on.
    pub declaration_hash: String,
    /// Whether the plan converges to absent.
    pub teardown: bool,
    /// Entries in reconciliation order.
    pub entries: Vec<PlanEntry>,
}

/// Planned changes for one resource.
#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    /// Resource name.
    pub resource: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Keys that do not hold.
    pub mismatches: Vec<Mismatch>,
    /// Declared keys the probe cannot observe.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unobservable: Vec<String>,
    /// Actions an apply would take.
    pub actions: Vec<Action>,
    /// Probe failure, if the resource could not be observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(target: &str, declaration_hash: &str, teardown: bool) -> Self {
        Self {
            created_at: Utc::now(),
            target: target.to_string(),
            declaration_hash: declaration_hash.to_string(),
            teardown,
            entries: Vec::new(),
        }
    }

    /// Returns true if no resource needs an action and none failed to probe.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.actions.is_empty() && e.error.is_none())
    }

    /// Returns the number of actions.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.entries.iter().map(|e| e.actions.len()).sum()
    }

    /// Returns the number of actions of one kind.
    #[must_use]
    pub fn count_of(&self, kind: ActionKind) -> usize {
        self.entries
            .iter()
            .flat_map(|e| &e.actions)
            .filter(|a| a.kind == kind)
            .count()
    }

    /// Returns all actions in execution order.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.entries.iter().flat_map(|e| &e.actions)
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan for {} ({} actions):", self.target, self.action_count())?;
        for (i, action) in self.actions().enumerate() {
            writeln!(f, "  {}. {action}", i + 1)?;
        }

        for entry in self.entries.iter().filter(|e| e.error.is_some()) {
            if let Some(error) = &entry.error {
                writeln!(f, "  ! {}: {error}", entry.resource)?;
            }
        }

        Ok(())
    }
}

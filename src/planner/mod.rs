//! Planning module for convergence.
//!
//! This module compares desired and observed state, computes the corrective
//! actions for a resource and executes them through the control plane.

mod diff;
mod action;
mod plan;
mod executor;

pub use diff::{AttributeDiff, EVENTUAL_KEYS, Mismatch};
pub use action::{Action, ActionKind, plan_actions, retry_actions};
pub use plan::{Plan, PlanEntry};
pub use executor::{ActionExecutor, PassResult};

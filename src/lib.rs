// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(unused_must_use)]
#![deny(nonstandard_style)]
#![forbid(unsafe_op_in_unsafe_fn)]

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::cognitive_complexity)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Agent Converge
//!
//! A declarative, idempotent convergence engine for single-host
//! log-management agents (server or forwarder role).
//!
//! ## Overview
//!
//! Instead of linear install, configure and uninstall scripts, the target is
//! described once as data and converged:
//!
//! - Declare resources (the service, indexes, inputs, forwarding targets,
//!   deployment apps) in a YAML file
//! - Probe their actual state through an [`AgentControlPlane`]
//! - Apply the minimal corrective actions, in dependency order
//! - Verify the end state and report PASS / WARN / FAIL per resource
//!
//! ## Architecture
//!
//! 1. **Desired state**: [`DesiredStateStore`], loaded once per run
//! 2. **Observed state**: [`ResourceProbe`], fresh on every probe
//! 3. **Reconciler**: computes actions, applies them, re-probes, retries once
//! 4. **Report**: per-resource outcomes mapped to exit codes 0 / 1 / 2
//! 5. **Orchestrator**: runs `apply`, `verify` and `teardown`
//!
//! ## Modules
//!
//! - [`config`]: Declaration parsing, validation and hashing
//! - [`desired`]: Resources and dependency ordering
//! - [`control`]: Control plane capability, probing and endpoint checks
//! - [`planner`]: Attribute diffs, actions and execution
//! - [`reconciler`]: Per-resource convergence
//! - [`report`]: Outcomes, reports, persistence and the run lock
//! - [`orchestrator`]: Run state machine
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! target:
//!   name: log-server
//!   home: /opt/logserver
//!
//! resources:
//!   - kind: service
//!     name: core
//!     desired: { installed: true, running: true }
//!   - kind: index
//!     name: main
//!     desired: { present: true }
//!     depends_on: [core]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod control;
pub mod desired;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod reconciler;
pub mod report;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, ContentHasher, Declaration};
pub use control::{AgentControlPlane, CommandControlPlane, ObservedState, ResourceProbe};
pub use desired::{DesiredStateStore, Resource};
pub use error::{ConvergeError, Result};
pub use orchestrator::Orchestrator;
pub use planner::{Action, ActionKind, Plan};
pub use reconciler::{ReconcileResult, Reconciler};
pub use report::{Outcome, OutcomeStatus, Report, ReportStore, RunMode};

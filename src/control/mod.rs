//! Control plane integration.
//!
//! This module provides the [`AgentControlPlane`] capability, its
//! command-driven implementation, resource probing and HTTP endpoint checks.

mod plane;
mod command;
mod probe;
mod health;

#[cfg(test)]
pub(crate) mod fake;

pub use plane::{AgentControlPlane, ControlResult, ServiceStatus};
#[cfg(test)]
pub use plane::MockAgentControlPlane;
pub use command::CommandControlPlane;
pub use probe::{ObservedState, ResourceProbe};
pub use health::{EndpointCheck, HealthChecker};

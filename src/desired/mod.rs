//! Desired state for a run.
//!
//! Resolves declaration records into immutable [`Resource`]s, holds them in a
//! [`DesiredStateStore`] and orders them by dependency.

mod resource;
mod graph;
mod store;

pub use resource::{CONFIG_HASH_KEY, Payload, Resource};
pub use graph::topological_order;
pub use store::DesiredStateStore;

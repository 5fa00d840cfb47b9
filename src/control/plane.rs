//! The agent control plane capability.
//!
//! Every mutation and every probe goes through [`AgentControlPlane`]. Each
//! call returns a tagged result so failures can never be mistaken for an
//! absent resource.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::AttrValue;
use crate::error::ControlError;

/// Result of a control plane call.
pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// Status of the agent service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    /// Whether the agent is installed.
    pub installed: bool,
    /// Whether the agent is running.
    pub running: bool,
    /// Process id, when running and known.
    pub pid: Option<u32>,
}

/// Management interface of the agent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentControlPlane: Send + Sync {
    /// Installs the agent.
    async fn install(&self) -> ControlResult<()>;

    /// Removes the agent.
    async fn uninstall(&self) -> ControlResult<()>;

    /// Starts the agent service.
    async fn start(&self) -> ControlResult<()>;

    /// Stops the agent service.
    async fn stop(&self) -> ControlResult<()>;

    /// Restarts the agent service.
    async fn restart(&self) -> ControlResult<()>;

    /// Reports whether the agent is installed and running.
    async fn status(&self) -> ControlResult<ServiceStatus>;

    /// Writes a config blob and returns the hash of what was stored.
    async fn write_config(&self, name: &str, content: &[u8]) -> ControlResult<String>;

    /// Returns the hash of a stored config blob, or `None` if it does not exist.
    async fn read_config_hash(&self, name: &str) -> ControlResult<Option<String>>;

    /// Removes a config blob. Removing a missing blob succeeds.
    async fn remove_config(&self, name: &str) -> ControlResult<()>;

    /// Creates an index with the given creation parameters.
    async fn create_index(
        &self,
        name: &str,
        params: &BTreeMap<String, AttrValue>,
    ) -> ControlResult<()>;

    /// Removes an index.
    async fn remove_index(&self, name: &str) -> ControlResult<()>;

    /// Lists index names.
    async fn list_indexes(&self) -> ControlResult<Vec<String>>;

    /// Returns true if something listens on `port` on the local host.
    async fn port_listening(&self, port: u16) -> ControlResult<bool>;
}

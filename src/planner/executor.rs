//! Action executor.
//!
//! Maps each [`Action`] to the control plane call for its resource kind and
//! runs it under a timeout. Every action is idempotent on the agent side.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ResourceKind;
use crate::control::{AgentControlPlane, ControlResult};
use crate::desired::Resource;
use crate::error::{ActionError, ControlError};

use super::action::{Action, ActionKind};

/// Executes actions against the control plane.
#[derive(Clone)]
pub struct ActionExecutor {
    /// Control plane.
    plane: Arc<dyn AgentControlPlane>,
    /// Timeout for a single action.
    timeout: Duration,
}

/// Result of executing the actions of one pass.
#[derive(Debug, Clone, Default)]
pub struct PassResult {
    /// Actions that completed.
    pub applied: Vec<Action>,
    /// The failure that stopped the pass, if any.
    pub error: Option<ActionError>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    /// Creates a new executor.
    #[must_use]
    pub const fn new(plane: Arc<dyn AgentControlPlane>, timeout: Duration) -> Self {
        Self { plane, timeout }
    }

    /// Executes `actions` in order, stopping at the first failure.
    pub async fn execute_all(&self, actions: &[Action], resource: &Resource) -> PassResult {
        let mut result = PassResult::default();

        for action in actions {
            match self.execute(action, resource).await {
                Ok(()) => result.applied.push(action.clone()),
                Err(e) => {
                    warn!("{e}");
                    result.error = Some(e);
                    break;
                }
            }
        }

        result
    }

    /// Executes a single action.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] if the control plane call fails or times out.
    pub async fn execute(&self, action: &Action, resource: &Resource) -> Result<(), ActionError> {
        info!("Applying {action}");

        let outcome = tokio::time::timeout(self.timeout, self.dispatch(action, resource)).await;
        let result = outcome.unwrap_or_else(|_| {
            Err(ControlError::Timeout {
                operation: action.kind.to_string(),
                timeout_secs: self.timeout.as_secs(),
            })
        });

        result.map_err(|source| ActionError {
            action: action.to_string(),
            resource: resource.name.clone(),
            source,
        })
    }

    async fn dispatch(&self, action: &Action, resource: &Resource) -> ControlResult<()> {
        match (resource.kind, action.kind) {
            (ResourceKind::Service, ActionKind::Install) => self.plane.install().await,
            (ResourceKind::Service, ActionKind::Start) => self.plane.start().await,
            (ResourceKind::Service, ActionKind::Stop) => self.plane.stop().await,
            (ResourceKind::Service, ActionKind::Restart) => self.plane.restart().await,
            (ResourceKind::Service, ActionKind::Uninstall) => self.plane.uninstall().await,
            (ResourceKind::Index, ActionKind::Install) => {
                self.plane
                    .create_index(&resource.name, &resource.creation_params())
                    .await
            }
            (ResourceKind::Index, ActionKind::Uninstall) => {
                self.plane.remove_index(&resource.name).await
            }
            (kind, ActionKind::Install | ActionKind::Configure)
                if kind != ResourceKind::Index =>
            {
                self.write_payload(action, resource).await
            }
            (kind, ActionKind::Uninstall) if kind.is_config_backed() => {
                self.plane.remove_config(&config_file(resource)).await
            }
            (kind, other) => Err(ControlError::CommandFailed {
                operation: other.to_string(),
                code: None,
                stderr: format!("{other} is not supported for {kind} resources"),
            }),
        }
    }

    async fn write_payload(&self, action: &Action, resource: &Resource) -> ControlResult<()> {
        let Some(payload) = &resource.payload else {
            return Err(ControlError::CommandFailed {
                operation: String::from("write_config"),
                code: None,
                stderr: format!("{resource} declares no payload"),
            });
        };

        let file = config_file(resource);
        let stored = self.plane.write_config(&file, &payload.content).await?;
        debug!("Stored {file} with hash {stored}");

        let expected = action.payload_hash.as_deref().unwrap_or(&payload.hash);
        if stored == expected {
            Ok(())
        } else {
            Err(ControlError::CommandFailed {
                operation: String::from("write_config"),
                code: None,
                stderr: format!("stored hash {stored} does not match payload hash {expected}"),
            })
        }
    }
}

fn config_file(resource: &Resource) -> String {
    resource
        .config_file
        .clone()
        .unwrap_or_else(|| format!("{}.conf", resource.name))
}

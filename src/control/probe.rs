//! Read-only probing of resources.
//!
//! A probe produces a fresh [`ObservedState`] on every call; nothing is
//! cached between probes.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::{AttrValue, ResourceKind};
use crate::desired::{CONFIG_HASH_KEY, Resource};
use crate::error::ProbeError;

use super::health::HealthChecker;
use super::plane::{AgentControlPlane, ControlResult};

/// Observed state of one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservedState {
    /// Whether the resource exists.
    pub present: bool,
    /// Observed attributes.
    pub attrs: BTreeMap<String, AttrValue>,
    /// Note about an observation that failed without being a probe error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ObservedState {
    /// Returns the observed value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    /// Returns an observed flag, treating a missing flag as false.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.attrs.get(key).and_then(AttrValue::as_bool).unwrap_or(false)
    }

    /// Returns the observed payload hash.
    #[must_use]
    pub fn config_hash(&self) -> Option<&str> {
        self.attrs.get(CONFIG_HASH_KEY).and_then(AttrValue::as_text)
    }
}

/// Probes resources through the control plane.
#[derive(Clone)]
pub struct ResourceProbe {
    /// Control plane.
    plane: Arc<dyn AgentControlPlane>,
    /// HTTP endpoint checker.
    health: HealthChecker,
    /// Timeout for a single control plane call.
    timeout: Duration,
}

impl std::fmt::Debug for ResourceProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceProbe")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ResourceProbe {
    /// Creates a probe over `plane`.
    #[must_use]
    pub const fn new(
        plane: Arc<dyn AgentControlPlane>,
        health: HealthChecker,
        timeout: Duration,
    ) -> Self {
        Self {
            plane,
            health,
            timeout,
        }
    }

    /// Probes the actual state of `resource`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProbeError`] if the control plane cannot answer. An absent
    /// resource is not an error.
    pub async fn probe(&self, resource: &Resource) -> Result<ObservedState, ProbeError> {
        debug!("Probing {resource}");

        let observed = match resource.kind {
            ResourceKind::Service => self.probe_service(resource).await?,
            ResourceKind::Index => self.probe_index(resource).await?,
            ResourceKind::Input
            | ResourceKind::ForwardTarget
            | ResourceKind::DeploymentApp
            | ResourceKind::Config => self.probe_config(resource).await?,
        };

        debug!("Observed {resource}: present={}", observed.present);
        Ok(observed)
    }

    async fn probe_service(&self, resource: &Resource) -> Result<ObservedState, ProbeError> {
        let status = self.call("status", self.plane.status()).await?;

        let mut observed = ObservedState {
            present: status.installed,
            ..ObservedState::default()
        };
        observed
            .attrs
            .insert(String::from("installed"), AttrValue::Bool(status.installed));
        observed
            .attrs
            .insert(String::from("running"), AttrValue::Bool(status.running));
        if let Some(pid) = status.pid {
            observed
                .attrs
                .insert(String::from("pid"), AttrValue::Int(i64::from(pid)));
        }

        if let Some(file) = &resource.config_file {
            if let Some(hash) = self
                .call("read_config_hash", self.plane.read_config_hash(file))
                .await?
            {
                observed
                    .attrs
                    .insert(String::from(CONFIG_HASH_KEY), AttrValue::Text(hash));
            }
        }

        if status.running {
            self.probe_port(resource, &mut observed).await?;

            if let Some(url) = resource.desired_endpoint() {
                let check = self.health.check_endpoint(url).await;
                if check.healthy {
                    observed
                        .attrs
                        .insert(String::from("endpoint"), AttrValue::from(url));
                } else {
                    observed.note = Some(check.to_string());
                }
            }
        }

        Ok(observed)
    }

    async fn probe_index(&self, resource: &Resource) -> Result<ObservedState, ProbeError> {
        let indexes = self.call("list_indexes", self.plane.list_indexes()).await?;
        let present = indexes.iter().any(|name| *name == resource.name);

        let mut observed = ObservedState {
            present,
            ..ObservedState::default()
        };
        observed
            .attrs
            .insert(String::from("present"), AttrValue::Bool(present));

        Ok(observed)
    }

    async fn probe_config(&self, resource: &Resource) -> Result<ObservedState, ProbeError> {
        let file = resource
            .config_file
            .clone()
            .unwrap_or_else(|| format!("{}.conf", resource.name));
        let hash = self
            .call("read_config_hash", self.plane.read_config_hash(&file))
            .await?;

        let mut observed = ObservedState {
            present: hash.is_some(),
            ..ObservedState::default()
        };
        observed
            .attrs
            .insert(String::from("present"), AttrValue::Bool(hash.is_some()));
        if let Some(hash) = hash {
            observed
                .attrs
                .insert(String::from(CONFIG_HASH_KEY), AttrValue::Text(hash));
        }

        if observed.present {
            self.probe_port(resource, &mut observed).await?;
        }

        Ok(observed)
    }

    /// Records the desired port as observed if something listens on it.
    async fn probe_port(
        &self,
        resource: &Resource,
        observed: &mut ObservedState,
    ) -> Result<(), ProbeError> {
        if let Some(port) = resource.desired_port() {
            if self
                .call("port_listening", self.plane.port_listening(port))
                .await?
            {
                observed
                    .attrs
                    .insert(String::from("port"), AttrValue::Int(i64::from(port)));
            }
        }
        Ok(())
    }

    /// Runs a control plane call under the probe timeout.
    async fn call<T>(
        &self,
        operation: &str,
        call: impl Future<Output = ControlResult<T>> + Send,
    ) -> Result<T, ProbeError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(ProbeError::from),
            Err(_) => Err(ProbeError::Timeout {
                message: format!(
                    "{operation} did not answer within {}s",
                    self.timeout.as_secs()
                ),
            }),
        }
    }
}

//! Corrective actions and their computation.
//!
//! Action computation is pure: it looks only at the resource and one observed
//! state, and emits actions in the fixed precedence install, configure,
//! start/stop. Converging to absent uses stop, then uninstall.

use std::fmt;

use serde::Serialize;

use crate::config::{ContentHasher, ResourceKind};
use crate::control::ObservedState;
use crate::desired::Resource;

/// Kind of corrective operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Install the service, or create an index.
    Install,
    /// Write the resource's payload.
    Configure,
    /// Start the service.
    Start,
    /// Stop the service.
    Stop,
    /// Restart the service.
    Restart,
    /// Uninstall the service, or remove an index or config blob.
    Uninstall,
}

/// One corrective operation targeting one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    /// Operation.
    pub kind: ActionKind,
    /// Target resource name.
    pub resource: String,
    /// Target resource kind.
    pub resource_kind: ResourceKind,
    /// Payload hash written by a configure action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
}

impl Action {
    /// Creates an action without a payload.
    #[must_use]
    pub fn new(kind: ActionKind, resource: &Resource) -> Self {
        Self {
            kind,
            resource: resource.name.clone(),
            resource_kind: resource.kind,
            payload_hash: None,
        }
    }

    /// Creates a configure action writing the payload with `hash`.
    #[must_use]
    pub fn configure(resource: &Resource, hash: &str) -> Self {
        Self {
            kind: ActionKind::Configure,
            resource: resource.name.clone(),
            resource_kind: resource.kind,
            payload_hash: Some(hash.to_string()),
        }
    }

    /// Returns the control plane operation this action performs,
    /// e.g. `create_index` for an index install.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match (self.kind, self.resource_kind) {
            (ActionKind::Install, ResourceKind::Index) => "create_index",
            (ActionKind::Uninstall, ResourceKind::Index) => "remove_index",
            (ActionKind::Uninstall, ResourceKind::Service) => "uninstall",
            (ActionKind::Uninstall, _) => "remove_config",
            (ActionKind::Configure, _) => "write_config",
            (ActionKind::Install, _) => "install",
            (ActionKind::Start, _) => "start",
            (ActionKind::Stop, _) => "stop",
            (ActionKind::Restart, _) => "restart",
        }
    }

    /// Returns true if this action changes the resource's configuration.
    #[must_use]
    pub const fn is_change(&self) -> bool {
        !matches!(self.kind, ActionKind::Restart)
    }
}

/// Computes the actions that move `observed` toward the desired state.
///
/// Returns no actions when nothing the engine can act on differs.
#[must_use]
pub fn plan_actions(resource: &Resource, observed: &ObservedState) -> Vec<Action> {
    match resource.kind {
        ResourceKind::Service => service_actions(resource, observed),
        ResourceKind::Index => index_actions(resource, observed),
        ResourceKind::Input
        | ResourceKind::ForwardTarget
        | ResourceKind::DeploymentApp
        | ResourceKind::Config => config_actions(resource, observed),
    }
}

/// Computes the actions of the single retry pass.
///
/// Uses [`plan_actions`] on the fresh observation; if that finds nothing to
/// do while keys still do not hold, the payload is re-applied and a running
/// service is restarted.
#[must_use]
pub fn retry_actions(resource: &Resource, observed: &ObservedState) -> Vec<Action> {
    let actions = plan_actions(resource, observed);
    if !actions.is_empty() || !resource.wants_present() {
        return actions;
    }

    let mut actions = Vec::new();
    if resource.kind != ResourceKind::Index {
        if let Some(payload) = &resource.payload {
            actions.push(Action::configure(resource, &payload.hash));
        }
    }
    if resource.kind == ResourceKind::Service && resource.wants_running() == Some(true) {
        actions.push(Action::new(ActionKind::Restart, resource));
    }
    actions
}

fn needs_payload(resource: &Resource, observed: &ObservedState) -> Option<String> {
    let payload = resource.payload.as_ref()?;
    let current = observed.config_hash();

    if current.is_some_and(|h| ContentHasher::hashes_match(h, &payload.hash)) {
        None
    } else {
        Some(payload.hash.clone())
    }
}

fn service_actions(resource: &Resource, observed: &ObservedState) -> Vec<Action> {
    let mut actions = Vec::new();
    let installed = observed.flag("installed");
    let running = observed.flag("running");

    if !resource.wants_present() {
        if running {
            actions.push(Action::new(ActionKind::Stop, resource));
        }
        if installed {
            actions.push(Action::new(ActionKind::Uninstall, resource));
        }
        return actions;
    }

    if !installed {
        actions.push(Action::new(ActionKind::Install, resource));
    }

    let configure = needs_payload(resource, observed);
    let configured = configure.is_some();
    if let Some(hash) = configure {
        actions.push(Action::configure(resource, &hash));
    }

    match resource.wants_running() {
        Some(true) if !running => actions.push(Action::new(ActionKind::Start, resource)),
        Some(false) if running => actions.push(Action::new(ActionKind::Stop, resource)),
        Some(false) => {}
        _ if configured && running => actions.push(Action::new(ActionKind::Restart, resource)),
        _ => {}
    }

    actions
}

fn index_actions(resource: &Resource, observed: &ObservedState) -> Vec<Action> {
    match (resource.wants_present(), observed.present) {
        (true, false) => vec![Action::new(ActionKind::Install, resource)],
        (false, true) => vec![Action::new(ActionKind::Uninstall, resource)],
        _ => Vec::new(),
    }
}

fn config_actions(resource: &Resource, observed: &ObservedState) -> Vec<Action> {
    if !resource.wants_present() {
        return if observed.present {
            vec![Action::new(ActionKind::Uninstall, resource)]
        } else {
            Vec::new()
        };
    }

    needs_payload(resource, observed)
        .map(|hash| vec![Action::configure(resource, &hash)])
        .unwrap_or_default()
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::Configure => "configure",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Uninstall => "uninstall",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload_hash {
            Some(hash) => write!(
                f,
                "{}({}@{})",
                self.verb(),
                self.resource,
                ContentHasher::short_hash(hash)
            ),
            None => write!(f, "{}({})", self.verb(), self.resource),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttrValue;
    use crate::desired::{CONFIG_HASH_KEY, Payload};
    use std::collections::BTreeMap;

    fn service(running: bool) -> Resource {
        Resource {
            kind: ResourceKind::Service,
            name: String::from("core"),
            desired: BTreeMap::from([
                (String::from("installed"), AttrValue::Bool(true)),
                (String::from("running"), AttrValue::Bool(running)),
            ]),
            depends_on: vec![],
            notify: vec![],
            config_file: None,
            payload: None,
        }
    }

    fn input(content: &str) -> Resource {
        let hash = ContentHasher::new().hash_payload(content);
        Resource {
            kind: ResourceKind::Input,
            name: String::from("tcp"),
            desired: BTreeMap::from([
                (String::from("present"), AttrValue::Bool(true)),
                (String::from(CONFIG_HASH_KEY), AttrValue::Text(hash.clone())),
            ]),
            depends_on: vec![],
            notify: vec![],
            config_file: Some(String::from("inputs.conf")),
            payload: Some(Payload {
                content: content.as_bytes().to_vec(),
                hash,
            }),
        }
    }

    fn observed(attrs: &[(&str, AttrValue)]) -> ObservedState {
        ObservedState {
            present: attrs.iter().any(|(k, v)| {
                (*k == "installed" || *k == "present") && *v == AttrValue::Bool(true)
            }),
            attrs: attrs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            note: None,
        }
    }

    fn kinds(actions: &[Action]) -> Vec<ActionKind> {
        actions.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn test_fresh_service_installs_then_starts() {
        let actions = plan_actions(&service(true), &ObservedState::default());
        assert_eq!(kinds(&actions), vec![ActionKind::Install, ActionKind::Start]);
        assert_eq!(actions[0].to_string(), "install(core)");
    }

    #[test]
    fn test_converged_service_needs_nothing() {
        let actual = observed(&[("installed", true.into()), ("running", true.into())]);
        assert!(plan_actions(&service(true), &actual).is_empty());
    }

    #[test]
    fn test_stop_when_not_wanted_running() {
        let actual = observed(&[("installed", true.into()), ("running", true.into())]);
        assert_eq!(
            kinds(&plan_actions(&service(false), &actual)),
            vec![ActionKind::Stop]
        );
    }

    #[test]
    fn test_absent_service_stops_then_uninstalls() {
        let actual = observed(&[("installed", true.into()), ("running", true.into())]);
        let actions = plan_actions(&service(true).to_absent(), &actual);
        assert_eq!(kinds(&actions), vec![ActionKind::Stop, ActionKind::Uninstall]);
    }

    #[test]
    fn test_service_payload_change_restarts() {
        let mut core = service(true);
        core.config_file = Some(String::from("server.conf"));
        core.payload = Some(Payload {
            content: b"[general]".to_vec(),
            hash: ContentHasher::new().hash_payload("[general]"),
        });
        let actual = observed(&[("installed", true.into()), ("running", true.into())]);

        let actions = plan_actions(&core, &actual);
        assert_eq!(kinds(&actions), vec![ActionKind::Configure, ActionKind::Restart]);
    }

    #[test]
    fn test_config_written_only_when_hash_differs() {
        let resource = input("[tcp://9997]");
        let stale = ContentHasher::new().hash_payload("[tcp://9998]");

        let actions = plan_actions(
            &resource,
            &observed(&[("present", true.into()), (CONFIG_HASH_KEY, AttrValue::Text(stale))]),
        );
        assert_eq!(kinds(&actions), vec![ActionKind::Configure]);
        assert!(actions[0].to_string().starts_with("write_config(tcp@"));

        let current = resource.payload.as_ref().map(|p| p.hash.clone()).unwrap_or_default();
        let actions = plan_actions(
            &resource,
            &observed(&[("present", true.into()), (CONFIG_HASH_KEY, AttrValue::Text(current))]),
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn test_index_create_and_remove() {
        let main = Resource {
            kind: ResourceKind::Index,
            name: String::from("main"),
            desired: BTreeMap::from([(String::from("present"), AttrValue::Bool(true))]),
            depends_on: vec![],
            notify: vec![],
            config_file: None,
            payload: None,
        };

        let create = plan_actions(&main, &ObservedState::default());
        assert_eq!(kinds(&create), vec![ActionKind::Install]);
        assert_eq!(create[0].to_string(), "create_index(main)");

        let remove = plan_actions(&main.to_absent(), &observed(&[("present", true.into())]));
        assert_eq!(kinds(&remove), vec![ActionKind::Uninstall]);
        assert_eq!(remove[0].to_string(), "remove_index(main)");
    }

    #[test]
    fn test_retry_reapplies_payload_and_restarts() {
        let mut core = service(true);
        core.config_file = Some(String::from("server.conf"));
        core.payload = Some(Payload {
            content: b"[general]".to_vec(),
            hash: ContentHasher::new().hash_payload("[general]"),
        });
        let hash = ContentHasher::new().hash_payload("[general]");
        let actual = observed(&[
            ("installed", true.into()),
            ("running", true.into()),
            (CONFIG_HASH_KEY, AttrValue::Text(hash)),
        ]);

        assert!(plan_actions(&core, &actual).is_empty());
        assert_eq!(
            kinds(&retry_actions(&core, &actual)),
            vec![ActionKind::Configure, ActionKind::Restart]
        );
    }
}

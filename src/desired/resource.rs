//! Resolved resources.
//!
//! A [`Resource`] is a declaration record after normalisation: payloads are
//! loaded and hashed, implied attributes are filled in, and the config file
//! name is fixed. Resources are immutable for the duration of a run.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::{AttrValue, ResourceKind};

/// Observed/desired key holding the payload hash.
pub const CONFIG_HASH_KEY: &str = "config_hash";

/// A single managed resource with its desired attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Unique name.
    pub name: String,
    /// Desired attributes, including the derived `config_hash`.
    pub desired: BTreeMap<String, AttrValue>,
    /// Names of resources that must converge first.
    pub depends_on: Vec<String>,
    /// Services restarted at the end of the pass when this resource changed.
    pub notify: Vec<String>,
    /// Config file holding this resource's payload.
    pub config_file: Option<String>,
    /// Payload to write, if any.
    #[serde(skip)]
    pub payload: Option<Payload>,
}

/// An opaque config blob and its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Raw bytes written to the config file.
    pub content: Vec<u8>,
    /// SHA-256 of `content`.
    pub hash: String,
}

impl Resource {
    /// Returns the desired boolean for `key`, if declared.
    #[must_use]
    pub fn desired_flag(&self, key: &str) -> Option<bool> {
        self.desired.get(key).and_then(AttrValue::as_bool)
    }

    /// Returns true if the resource should exist.
    #[must_use]
    pub fn wants_present(&self) -> bool {
        self.desired_flag(self.kind.presence_key()).unwrap_or(false)
    }

    /// Returns the desired running flag, if this resource declares one.
    #[must_use]
    pub fn wants_running(&self) -> Option<bool> {
        self.desired_flag("running")
    }

    /// Returns the desired payload hash, if any.
    #[must_use]
    pub fn desired_hash(&self) -> Option<&str> {
        self.desired.get(CONFIG_HASH_KEY).and_then(AttrValue::as_text)
    }

    /// Returns the desired port, if any.
    #[must_use]
    pub fn desired_port(&self) -> Option<u16> {
        self.desired
            .get("port")
            .and_then(AttrValue::as_int)
            .and_then(|p| u16::try_from(p).ok())
    }

    /// Returns the desired HTTP endpoint, if any.
    #[must_use]
    pub fn desired_endpoint(&self) -> Option<&str> {
        self.desired.get("endpoint").and_then(AttrValue::as_text)
    }

    /// Returns the creation parameters passed to the control plane for an index.
    #[must_use]
    pub fn creation_params(&self) -> BTreeMap<String, AttrValue> {
        self.desired
            .iter()
            .filter(|(k, _)| k.as_str() != "present")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Returns this resource with its desired state mapped to absent.
    ///
    /// Services become not running and not installed; everything else becomes
    /// not present. The config file name is kept so the blob can be removed.
    #[must_use]
    pub fn to_absent(&self) -> Self {
        let mut desired = BTreeMap::new();

        match self.kind {
            ResourceKind::Service => {
                desired.insert(String::from("running"), AttrValue::Bool(false));
                desired.insert(String::from("installed"), AttrValue::Bool(false));
            }
            _ => {
                desired.insert(String::from("present"), AttrValue::Bool(false));
            }
        }

        Self {
            kind: self.kind,
            name: self.name.clone(),
            desired,
            depends_on: self.depends_on.clone(),
            notify: Vec::new(),
            config_file: self.config_file.clone(),
            payload: None,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

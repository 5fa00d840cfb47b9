//! Declaration types for the convergence engine.
//!
//! This module defines the structs that map to a `converge.yaml` desired-state
//! declaration. The declaration is data, not templated text: every resource is
//! a record of kind, name, desired attributes and dependencies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use validator::Validate;

/// The root structure of a desired-state declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Declaration {
    /// The agent installation the resources live on.
    pub target: TargetConfig,
    /// Probe timeouts and polling windows.
    #[serde(default)]
    pub probe: ProbeSettings,
    /// Where the last report is persisted.
    #[serde(default)]
    pub report: ReportConfig,
    /// Ordered resource records.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

/// The agent installation targeted by a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    /// Name of the target (used in reports and lock holder ids).
    pub name: String,
    /// Installation home of the agent.
    pub home: String,
    /// Control binary, relative to `home`.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Directory for config blobs, relative to `home`.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    /// Command templates for the control plane.
    #[serde(default)]
    pub commands: CommandTemplates,
}

/// Argv templates used by the command-driven control plane.
///
/// Templates may use the `{home}`, `{bin}` and `{name}` placeholders.
/// Unset entries fall back to the agent binary's conventional subcommands,
/// except `install` and `uninstall` which have no default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandTemplates {
    /// Installs the agent package.
    #[serde(default)]
    pub install: Option<Vec<String>>,
    /// Removes the agent package.
    #[serde(default)]
    pub uninstall: Option<Vec<String>>,
    /// Starts the agent service.
    #[serde(default)]
    pub start: Option<Vec<String>>,
    /// Stops the agent service.
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    /// Restarts the agent service.
    #[serde(default)]
    pub restart: Option<Vec<String>>,
    /// Reports service status; exit code 0 means running.
    #[serde(default)]
    pub status: Option<Vec<String>>,
    /// Creates an index.
    #[serde(default)]
    pub create_index: Option<Vec<String>>,
    /// Removes an index.
    #[serde(default)]
    pub remove_index: Option<Vec<String>>,
    /// Lists indexes, one name per output line.
    #[serde(default)]
    pub list_indexes: Option<Vec<String>>,
}

/// Probe timeouts and polling windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProbeSettings {
    /// Timeout for a single control plane call.
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub timeout_secs: u64,
    /// Number of polls while waiting for ports and endpoints to come up.
    #[serde(default = "default_poll_attempts")]
    #[validate(range(min = 1, max = 1000))]
    pub poll_attempts: u32,
    /// Delay between polls.
    #[serde(default = "default_poll_interval_secs")]
    #[validate(range(max = 300))]
    pub poll_interval_secs: u64,
}

/// Report persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: ReportBackend,
    /// Local report directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region.
    #[serde(default)]
    pub region: Option<String>,
}

/// Report backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportBackend {
    /// Local file-based storage.
    #[default]
    Local,
    /// AWS S3-based storage.
    S3,
}

/// A single resource record in the declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDecl {
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Unique name across the declaration.
    pub name: String,
    /// Desired attributes.
    #[serde(default)]
    pub desired: BTreeMap<String, AttrValue>,
    /// Names of resources that must converge first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Services restarted once at the end of the pass if this resource changed.
    #[serde(default)]
    pub notify: Vec<String>,
    /// Config file the payload is written to.
    #[serde(default)]
    pub file: Option<String>,
    /// Inline payload.
    #[serde(default)]
    pub content: Option<String>,
    /// Payload file, relative to the declaration.
    #[serde(default)]
    pub source: Option<String>,
}

/// Kinds of managed resources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// The agent service itself.
    Service,
    /// A data index.
    Index,
    /// A data input (listening port, monitored path).
    Input,
    /// A forwarding target.
    ForwardTarget,
    /// A deployment server app bundle or server class.
    DeploymentApp,
    /// Any other config blob.
    Config,
}

/// A desired or observed attribute value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AttrValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Text value.
    Text(String),
}

impl ResourceKind {
    /// Returns true if the resource's presence is the presence of its config blob.
    #[must_use]
    pub const fn is_config_backed(self) -> bool {
        matches!(
            self,
            Self::Input | Self::ForwardTarget | Self::DeploymentApp | Self::Config
        )
    }

    /// Returns the attribute key that expresses existence for this kind.
    #[must_use]
    pub const fn presence_key(self) -> &'static str {
        match self {
            Self::Service => "installed",
            _ => "present",
        }
    }
}

impl AttrValue {
    /// Returns the boolean value, if this is a flag.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the text value, if this is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Service => "service",
            Self::Index => "index",
            Self::Input => "input",
            Self::ForwardTarget => "forward_target",
            Self::DeploymentApp => "deployment_app",
            Self::Config => "config",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_attempts: default_poll_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            backend: ReportBackend::Local,
            path: None,
            bucket: None,
            prefix: None,
            region: None,
        }
    }
}

impl Declaration {
    /// Returns the service resource, if one is declared.
    #[must_use]
    pub fn service(&self) -> Option<&ResourceDecl> {
        self.resources.iter().find(|r| r.kind == ResourceKind::Service)
    }
}

fn default_binary() -> String {
    String::from("bin/agent")
}

fn default_config_dir() -> String {
    String::from("etc/system/local")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_poll_attempts() -> u32 {
    60
}

const fn default_poll_interval_secs() -> u64 {
    5
}

//! Error types for the convergence engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! loading the declaration, probing and mutating the agent through its
//! control plane, ordering resources, persisting reports and orchestrating.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the convergence engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Declaration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Control plane could not answer a probe.
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// A corrective action failed.
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    /// Dependency graph errors.
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// Report persistence and locking errors.
    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    /// Orchestration errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Declaration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The declaration file was not found.
    #[error("Declaration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The declaration file could not be parsed.
    #[error("Failed to parse declaration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Declaration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A resource references a name that is not declared.
    #[error("Resource '{resource}' references unknown resource '{reference}'")]
    UnknownReference {
        /// Resource holding the reference.
        resource: String,
        /// The unknown name.
        reference: String,
    },

    /// A payload source file could not be read.
    #[error("Failed to read payload source {path}: {message}")]
    PayloadSource {
        /// Path of the payload source.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },
}

/// Errors returned by an [`AgentControlPlane`](crate::control::AgentControlPlane) call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    /// The control plane could not be reached at all.
    #[error("control plane unreachable: {message}")]
    Unreachable {
        /// Description of the failure.
        message: String,
    },

    /// The call did not complete in time.
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Timeout that expired.
        timeout_secs: u64,
    },

    /// The caller lacks permission for the call.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the failure.
        message: String,
    },

    /// The call ran but reported failure.
    #[error("{operation} failed (exit {code:?}): {stderr}")]
    CommandFailed {
        /// Operation that failed.
        operation: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Captured error output.
        stderr: String,
    },
}

/// Kind of a probe failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    /// Control plane unreachable.
    Unreachable,
    /// Probe timed out.
    Timeout,
    /// Probe was not permitted.
    PermissionDenied,
}

/// The control plane could not answer a probe.
///
/// Distinct from a resource being absent: a probe error never means "absent".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// Control plane unreachable.
    #[error("unreachable: {message}")]
    Unreachable {
        /// Description of the failure.
        message: String,
    },

    /// Probe timed out.
    #[error("timed out: {message}")]
    Timeout {
        /// Description of the failure.
        message: String,
    },

    /// Probe was not permitted.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the failure.
        message: String,
    },
}

/// A corrective action failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{action} on '{resource}' failed: {source}")]
pub struct ActionError {
    /// Description of the action.
    pub action: String,
    /// Resource the action targeted.
    pub resource: String,
    /// Underlying control plane error.
    pub source: ControlError,
}

/// Dependency graph errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DependencyError {
    /// The dependency graph contains a cycle.
    #[error("Circular dependency detected: {cycle}")]
    Cycle {
        /// Description of the cycle.
        cycle: String,
    },

    /// A resource depends on an undeclared resource.
    #[error("Resource '{resource}' depends on unknown resource '{dependency}'")]
    UnknownDependency {
        /// Resource declaring the dependency.
        resource: String,
        /// The unknown dependency.
        dependency: String,
    },
}

/// Report persistence and run-lock errors.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Report file not found.
    #[error("Report not found: {path}")]
    NotFound {
        /// Path to the missing report.
        path: PathBuf,
    },

    /// Stored report is corrupted.
    #[error("Stored report is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Run lock acquisition failed.
    #[error("Failed to acquire run lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Run lock is held by another process.
    #[error("Target is locked by another run (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local filesystem backend error.
    #[error("Local report backend error: {message}")]
    LocalError {
        /// Description of the failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 report backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("Report serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Orchestration errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The run was aborted.
    #[error("Run aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// Teardown was requested without destructive confirmation.
    #[error("Teardown of '{target}' requires explicit confirmation")]
    TeardownNotConfirmed {
        /// Target that would have been torn down.
        target: String,
    },
}

/// Result type alias for convergence operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl ControlError {
    /// Creates an unreachable error.
    #[must_use]
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
        }
    }

    /// Maps an IO error raised while talking to the control plane.
    #[must_use]
    pub fn from_io(operation: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                message: format!("{operation}: {err}"),
            },
            std::io::ErrorKind::TimedOut => Self::Timeout {
                operation: operation.to_string(),
                timeout_secs: 0,
            },
            _ => Self::Unreachable {
                message: format!("{operation}: {err}"),
            },
        }
    }
}

impl ProbeError {
    /// Returns the kind of this probe error.
    #[must_use]
    pub const fn kind(&self) -> ProbeErrorKind {
        match self {
            Self::Unreachable { .. } => ProbeErrorKind::Unreachable,
            Self::Timeout { .. } => ProbeErrorKind::Timeout,
            Self::PermissionDenied { .. } => ProbeErrorKind::PermissionDenied,
        }
    }
}

impl From<ControlError> for ProbeError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Timeout { .. } => Self::Timeout {
                message: err.to_string(),
            },
            ControlError::PermissionDenied { message } => Self::PermissionDenied { message },
            ControlError::Unreachable { message } => Self::Unreachable { message },
            ControlError::CommandFailed { .. } => Self::Unreachable {
                message: err.to_string(),
            },
        }
    }
}

impl ReportError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn local(message: impl Into<String>) -> Self {
        Self::LocalError {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failure_is_unreachable_probe() {
        let err = ControlError::CommandFailed {
            operation: String::from("list_indexes"),
            code: Some(1),
            stderr: String::from("daemon not running"),
        };

        let probe = ProbeError::from(err);
        assert_eq!(probe.kind(), ProbeErrorKind::Unreachable);
        assert!(probe.to_string().contains("daemon not running"));
    }

    #[test]
    fn test_timeout_maps_to_timeout_probe() {
        let err = ControlError::Timeout {
            operation: String::from("status"),
            timeout_secs: 30,
        };

        assert_eq!(ProbeError::from(err).kind(), ProbeErrorKind::Timeout);
    }

    #[test]
    fn test_io_permission_denied() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = ControlError::from_io("start", &io);
        assert!(matches!(err, ControlError::PermissionDenied { .. }));
    }
}

//! Declaration validation.
//!
//! Catches everything that can be judged without touching the target:
//! names, references, attribute types and contradictions. Dependency cycles
//! are detected later, when the desired-state graph is ordered.

use crate::error::{ConfigError, ConvergeError, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use validator::Validate;

use super::spec::{AttrValue, Declaration, ReportBackend, ResourceDecl, ResourceKind};

/// Attribute keys that are reconciled by the engine.
pub const KNOWN_KEYS: &[&str] = &["installed", "running", "present", "port", "endpoint"];

/// Attribute key derived from the payload; users may not set it.
pub const RESERVED_KEYS: &[&str] = &["config_hash", "pid"];

/// Validator for desired-state declarations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a declaration, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self, declaration: &Declaration) -> Result<ValidationResult> {
        let result = self.check(declaration);

        if let Some(first_error) = result.errors.first() {
            return Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Declaration validation passed");
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, declaration: &Declaration) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_target(declaration, &mut result);
        Self::validate_report(declaration, &mut result);
        Self::validate_resources(&declaration.resources, &mut result);

        result
    }

    /// Validates the target and probe settings.
    fn validate_target(declaration: &Declaration, result: &mut ValidationResult) {
        let target = &declaration.target;

        if target.name.is_empty() {
            result.error("target.name", "Target name cannot be empty");
        } else if !is_valid_name(&target.name) {
            result.error(
                "target.name",
                format!(
                    "Target name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    target.name
                ),
            );
        }

        if target.home.is_empty() {
            result.error("target.home", "Target home cannot be empty");
        } else if !target.home.starts_with('/') && !target.home.starts_with('~') {
            result
                .warnings
                .push(format!("target.home: '{}' is a relative path", target.home));
        }

        if target.commands.install.is_none() {
            result.warnings.push(String::from(
                "target.commands.install: not set, the agent cannot be installed by this run",
            ));
        }

        for (name, template) in target.commands.iter() {
            if template.is_some_and(Vec::is_empty) {
                result.error(
                    format!("target.commands.{name}"),
                    "Command template cannot be empty",
                );
            }
        }

        if let Err(e) = declaration.probe.validate() {
            result.error("probe", e.to_string());
        }
    }

    /// Validates report persistence settings.
    fn validate_report(declaration: &Declaration, result: &mut ValidationResult) {
        let report = &declaration.report;
        if report.backend == ReportBackend::S3 && report.bucket.as_ref().is_none_or(String::is_empty)
        {
            result.error(
                "report.bucket",
                "S3 bucket name is required when using S3 backend",
            );
        }
    }

    /// Validates all resource records.
    fn validate_resources(resources: &[ResourceDecl], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in declaration"));
            return;
        }

        let kinds: HashMap<&str, ResourceKind> = resources
            .iter()
            .map(|r| (r.name.as_str(), r.kind))
            .collect();

        let mut seen_names = HashSet::new();
        let mut services = 0usize;

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_names.insert(resource.name.as_str()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate resource name: {}", resource.name),
                );
            }

            if !is_valid_name(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens or underscores.",
                        resource.name
                    ),
                );
            }

            if resource.kind == ResourceKind::Service {
                services += 1;
            }

            Self::validate_references(resource, &prefix, &kinds, result);
            Self::validate_attributes(resource, &prefix, result);
            Self::validate_payload(resource, &prefix, result);
        }

        if services > 1 {
            result.error(
                "resources",
                format!("Declaration defines {services} services; a target has exactly one agent service"),
            );
        }
    }

    /// Validates `depends_on` and `notify` references.
    fn validate_references(
        resource: &ResourceDecl,
        prefix: &str,
        kinds: &HashMap<&str, ResourceKind>,
        result: &mut ValidationResult,
    ) {
        for (i, dep) in resource.depends_on.iter().enumerate() {
            if dep == &resource.name {
                result.error(
                    format!("{prefix}.depends_on[{i}]"),
                    format!("Resource '{}' depends on itself", resource.name),
                );
            } else if !kinds.contains_key(dep.as_str()) {
                result.error(
                    format!("{prefix}.depends_on[{i}]"),
                    ConfigError::UnknownReference {
                        resource: resource.name.clone(),
                        reference: dep.clone(),
                    }
                    .to_string(),
                );
            }
        }

        for (i, target) in resource.notify.iter().enumerate() {
            match kinds.get(target.as_str()) {
                Some(ResourceKind::Service) => {}
                Some(kind) => result.error(
                    format!("{prefix}.notify[{i}]"),
                    format!("Only services can be notified, '{target}' is a {kind}"),
                ),
                None => result.error(
                    format!("{prefix}.notify[{i}]"),
                    ConfigError::UnknownReference {
                        resource: resource.name.clone(),
                        reference: target.clone(),
                    }
                    .to_string(),
                ),
            }
        }
    }

    /// Validates attribute keys, types and contradictions.
    fn validate_attributes(resource: &ResourceDecl, prefix: &str, result: &mut ValidationResult) {
        for (key, value) in &resource.desired {
            let field = format!("{prefix}.desired.{key}");

            if RESERVED_KEYS.contains(&key.as_str()) {
                result.error(field, format!("'{key}' is derived by the engine and cannot be declared"));
                continue;
            }

            if resource.kind == ResourceKind::Index
                && !matches!(key.as_str(), "present" | "installed" | "running")
            {
                result.warnings.push(format!(
                    "{field}: index creation parameter '{key}' is not read back; it will be reported as WARN"
                ));
                continue;
            }

            match key.as_str() {
                "installed" | "running" => {
                    if resource.kind != ResourceKind::Service {
                        result.error(field, format!("'{key}' only applies to services"));
                    } else if value.as_bool().is_none() {
                        result.error(field, format!("'{key}' must be a boolean"));
                    }
                }
                "present" => {
                    if resource.kind == ResourceKind::Service {
                        result.error(field, "Services use 'installed' instead of 'present'");
                    } else if value.as_bool().is_none() {
                        result.error(field, "'present' must be a boolean");
                    }
                }
                "port" => {
                    if !value.as_int().is_some_and(|p| (1..=65535).contains(&p)) {
                        result.error(field, format!("Invalid port: {value}"));
                    }
                }
                "endpoint" => {
                    if resource.kind != ResourceKind::Service {
                        result.error(field, "'endpoint' only applies to services");
                    } else if !value
                        .as_text()
                        .is_some_and(|u| u.starts_with("http://") || u.starts_with("https://"))
                    {
                        result.error(field, format!("Endpoint must be an http(s) URL: {value}"));
                    }
                }
                other => {
                    result.warnings.push(format!(
                        "{field}: '{other}' cannot be observed for a {}; it will be reported as WARN",
                        resource.kind
                    ));
                }
            }
        }

        let flag = |key: &str| resource.desired.get(key).and_then(AttrValue::as_bool);
        if flag("running") == Some(true) && flag("installed") == Some(false) {
            result.error(
                format!("{prefix}.desired"),
                "A service cannot be running while not installed",
            );
        }

        if resource.kind == ResourceKind::Service {
            for key in ["port", "endpoint"] {
                if !resource.desired.contains_key(key) {
                    continue;
                }
                let field = format!("{prefix}.desired.{key}");
                if flag("running") == Some(false) || flag("installed") == Some(false) {
                    result.error(field, format!("'{key}' cannot hold on a service that is not running"));
                } else if flag("running").is_none() {
                    result.warnings.push(format!(
                        "{field}: '{key}' only holds while the service runs; declare 'running: true'"
                    ));
                }
            }
        }
    }

    /// Validates payload settings.
    fn validate_payload(resource: &ResourceDecl, prefix: &str, result: &mut ValidationResult) {
        let has_payload = resource.content.is_some() || resource.source.is_some();

        if resource.content.is_some() && resource.source.is_some() {
            result.error(
                format!("{prefix}.source"),
                "Specify either 'content' or 'source', not both",
            );
        }

        if resource.kind == ResourceKind::Index && has_payload {
            result.error(
                format!("{prefix}.content"),
                "Indexes are created through the control plane and take no payload",
            );
        }

        if resource.kind.is_config_backed() && !has_payload {
            let present = resource.desired.get("present").and_then(AttrValue::as_bool);
            if present != Some(false) {
                result.error(
                    format!("{prefix}.content"),
                    format!("A {} needs a payload ('content' or 'source')", resource.kind),
                );
            }
        }

        if resource.file.is_some() && !has_payload {
            result
                .warnings
                .push(format!("{prefix}.file: set without a payload, ignored"));
        }
    }
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl super::spec::CommandTemplates {
    /// Iterates over `(name, template)` pairs.
    fn iter(&self) -> impl Iterator<Item = (&'static str, Option<&Vec<String>>)> {
        [
            ("install", self.install.as_ref()),
            ("uninstall", self.uninstall.as_ref()),
            ("start", self.start.as_ref()),
            ("stop", self.stop.as_ref()),
            ("restart", self.restart.as_ref()),
            ("status", self.status.as_ref()),
            ("create_index", self.create_index.as_ref()),
            ("remove_index", self.remove_index.as_ref()),
            ("list_indexes", self.list_indexes.as_ref()),
        ]
        .into_iter()
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens or underscores,
/// starting with a letter or underscore.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

//! In-memory desired-state store.
//!
//! Loaded once at the start of a run from a declaration and never mutated
//! afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{
    AttrValue, ConfigParser, ConfigValidator, ContentHasher, Declaration, ProbeSettings,
    ReportConfig, ResourceDecl, TargetConfig,
};
use crate::error::{ConfigError, ConvergeError, DependencyError, Result};

use super::graph::topological_order;
use super::resource::{CONFIG_HASH_KEY, Payload, Resource};

/// Desired state for one run.
#[derive(Debug, Clone)]
pub struct DesiredStateStore {
    /// Target the resources live on.
    target: TargetConfig,
    /// Probe settings.
    probe: ProbeSettings,
    /// Report persistence settings.
    report: ReportConfig,
    /// Resources in declaration order.
    resources: Vec<Resource>,
    /// Hash of the declaration the store was built from.
    declaration_hash: String,
}

impl DesiredStateStore {
    /// Loads, validates and resolves the declaration at `path`.
    ///
    /// A `.env` file beside the declaration is loaded first, then
    /// `CONVERGE_*` overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded, fails validation, or a
    /// payload source cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let base_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let parser = ConfigParser::new().with_base_path(&base_dir);
        parser.load_dotenv()?;
        let declaration = parser.load_with_env(path)?;

        let validation = ConfigValidator::new().validate(&declaration)?;
        for warning in &validation.warnings {
            debug!("Declaration warning: {warning}");
        }

        Self::from_declaration(declaration, &base_dir)
    }

    /// Builds the store from an already parsed declaration.
    ///
    /// `base_dir` resolves relative payload `source` paths.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload source cannot be read.
    pub fn from_declaration(declaration: Declaration, base_dir: &Path) -> Result<Self> {
        let hasher = ContentHasher::new();
        let declaration_hash = hasher.hash_declaration(&declaration);

        let resources = declaration
            .resources
            .iter()
            .map(|decl| Self::resolve(decl, base_dir, &hasher))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Loaded {} resources for target {}",
            resources.len(),
            declaration.target.name
        );

        Ok(Self {
            target: declaration.target,
            probe: declaration.probe,
            report: declaration.report,
            resources,
            declaration_hash,
        })
    }

    /// Resolves one declaration record into a resource.
    fn resolve(decl: &ResourceDecl, base_dir: &Path, hasher: &ContentHasher) -> Result<Resource> {
        let content = match (&decl.content, &decl.source) {
            (Some(content), _) => Some(content.clone().into_bytes()),
            (None, Some(source)) => {
                let path = base_dir.join(source);
                let content = std::fs::read(&path).map_err(|e| {
                    ConvergeError::Config(ConfigError::PayloadSource {
                        path: path.clone(),
                        message: e.to_string(),
                    })
                })?;
                Some(content)
            }
            (None, None) => None,
        };

        let payload = content.map(|content| Payload {
            hash: hasher.hash_payload(&content),
            content,
        });

        let mut desired: BTreeMap<String, AttrValue> = decl.desired.clone();

        // a declared resource exists unless it says otherwise
        let presence = *desired
            .entry(String::from(decl.kind.presence_key()))
            .or_insert(AttrValue::Bool(true))
            != AttrValue::Bool(false);

        if let Some(payload) = &payload {
            if presence {
                desired.insert(
                    String::from(CONFIG_HASH_KEY),
                    AttrValue::Text(payload.hash.clone()),
                );
            }
        }

        let config_file = if decl.kind.is_config_backed() || payload.is_some() {
            Some(
                decl.file
                    .clone()
                    .unwrap_or_else(|| format!("{}.conf", decl.name)),
            )
        } else {
            None
        };

        Ok(Resource {
            kind: decl.kind,
            name: decl.name.clone(),
            desired,
            depends_on: decl.depends_on.clone(),
            notify: decl.notify.clone(),
            config_file,
            payload,
        })
    }

    /// Returns resources in reconciliation order.
    ///
    /// # Errors
    ///
    /// Returns a [`DependencyError`] if the graph is cyclic or dangling.
    pub fn apply_order(&self) -> std::result::Result<Vec<&Resource>, DependencyError> {
        let order = topological_order(&self.resources)?;
        Ok(order.into_iter().map(|i| &self.resources[i]).collect())
    }

    /// Returns the resources in declaration order.
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Looks up a resource by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Returns the names of resources that declare a dependency on `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|r| r.depends_on.iter().any(|d| d == name))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Returns the target configuration.
    #[must_use]
    pub const fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// Returns the probe settings.
    #[must_use]
    pub const fn probe_settings(&self) -> &ProbeSettings {
        &self.probe
    }

    /// Returns the report persistence settings.
    #[must_use]
    pub const fn report_config(&self) -> &ReportConfig {
        &self.report
    }

    /// Returns the declaration hash.
    #[must_use]
    pub fn declaration_hash(&self) -> &str {
        &self.declaration_hash
    }
}

//! Declaration parser for loading desired-state files.
//!
//! This module loads declarations from YAML or JSON files, applies
//! environment variable overrides and loads `.env` files.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{Declaration, ReportBackend};

/// Parser for desired-state declarations.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new declaration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a declaration from a YAML or JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Declaration> {
        let path = path.as_ref();
        info!("Loading declaration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            self.parse_json(&content, Some(path))
        } else {
            self.parse_yaml(&content, Some(path))
        }
    }

    /// Parses a declaration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Declaration> {
        debug!("Parsing YAML declaration");

        let declaration: Declaration = serde_yaml::from_str(content).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed declaration for target {} ({} resources)",
            declaration.target.name,
            declaration.resources.len()
        );
        Ok(declaration)
    }

    /// Parses a declaration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn parse_json(&self, content: &str, source: Option<&Path>) -> Result<Declaration> {
        debug!("Parsing JSON declaration");

        serde_json::from_str(content).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("JSON parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })
    }

    /// Loads a declaration with environment variable overrides.
    ///
    /// Recognised variables: `CONVERGE_TARGET_HOME`, `CONVERGE_REPORT_BACKEND`,
    /// `CONVERGE_REPORT_PATH`, `CONVERGE_REPORT_BUCKET`, `CONVERGE_REPORT_PREFIX`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Declaration> {
        let mut declaration = self.load_file(path)?;
        Self::apply_env_overrides(&mut declaration, |key| std::env::var(key).ok())?;
        Ok(declaration)
    }

    /// Applies overrides looked up through `lookup`.
    fn apply_env_overrides(
        declaration: &mut Declaration,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(home) = lookup("CONVERGE_TARGET_HOME") {
            debug!("Overriding target.home from environment");
            declaration.target.home = home;
        }

        if let Some(backend) = lookup("CONVERGE_REPORT_BACKEND") {
            debug!("Overriding report.backend from environment");
            declaration.report.backend = match backend.to_ascii_lowercase().as_str() {
                "local" => ReportBackend::Local,
                "s3" => ReportBackend::S3,
                other => {
                    return Err(ConvergeError::Config(ConfigError::validation(
                        format!("Unknown report backend '{other}'"),
                        "CONVERGE_REPORT_BACKEND",
                    )));
                }
            };
        }

        if let Some(path) = lookup("CONVERGE_REPORT_PATH") {
            debug!("Overriding report.path from environment");
            declaration.report.path = Some(path);
        }

        if let Some(bucket) = lookup("CONVERGE_REPORT_BUCKET") {
            debug!("Overriding report.bucket from environment");
            declaration.report.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("CONVERGE_REPORT_PREFIX") {
            debug!("Overriding report.prefix from environment");
            declaration.report.prefix = Some(prefix);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default declaration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "converge.yaml",
    "converge.yml",
    "desired-state.yaml",
    "desired-state.yml",
];

/// Finds the declaration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no declaration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found declaration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

/// Expands a leading `~` in a configured path to the user's home directory.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{AttrValue, ResourceKind};
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_declaration() {
        let yaml = r"
target:
  name: log-server
  home: /opt/logserver
resources: []
";
        let parser = ConfigParser::new();
        let declaration = parser.parse_yaml(yaml, None).expect("should parse");

        assert_eq!(declaration.target.name, "log-server");
        assert_eq!(declaration.target.binary, "bin/agent");
        assert_eq!(declaration.target.config_dir, "etc/system/local");
        assert_eq!(declaration.probe.timeout_secs, 30);
        assert_eq!(declaration.report.backend, ReportBackend::Local);
    }

    #[test]
    fn test_parse_full_declaration() {
        let yaml = r#"
target:
  name: forwarder
  home: /opt/forwarder
  binary: bin/fwd
  commands:
    install: ["dpkg", "-i", "/tmp/forwarder.deb"]
    start: ["{bin}", "start", "--accept-license"]
probe:
  timeout_secs: 10
  poll_attempts: 12
  poll_interval_secs: 5
report:
  backend: s3
  bucket: audit
  prefix: forwarders/prod
resources:
  - kind: service
    name: core
    desired:
      installed: true
      running: true
      port: 8089
  - kind: forward_target
    name: indexer
    file: outputs.conf
    content: |
      [tcpout:default]
      server = 10.0.0.5:9997
    desired:
      present: true
    depends_on: [core]
    notify: [core]
"#;
        let parser = ConfigParser::new();
        let declaration = parser.parse_yaml(yaml, None).expect("should parse");

        assert_eq!(declaration.resources.len(), 2);
        assert_eq!(declaration.resources[1].kind, ResourceKind::ForwardTarget);
        assert_eq!(declaration.resources[1].depends_on, vec![String::from("core")]);
        assert_eq!(declaration.resources[0].desired["port"], AttrValue::Int(8089));
        assert_eq!(
            declaration.target.commands.start,
            Some(vec![
                String::from("{bin}"),
                String::from("start"),
                String::from("--accept-license")
            ])
        );
        assert_eq!(declaration.report.backend, ReportBackend::S3);
    }

    #[test]
    fn test_parse_json_declaration() {
        let json = r#"{
            "target": {"name": "srv", "home": "/opt/srv"},
            "resources": [
                {"kind": "index", "name": "main", "desired": {"present": true}}
            ]
        }"#;
        let declaration = ConfigParser::new()
            .parse_json(json, None)
            .expect("should parse");
        assert_eq!(declaration.resources[0].kind, ResourceKind::Index);
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let result = ConfigParser::new().parse_yaml("target: [", None);
        assert!(matches!(
            result,
            Err(ConvergeError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let yaml = "target:\n  name: srv\n  home: /opt/srv\n";
        let mut declaration = ConfigParser::new().parse_yaml(yaml, None).expect("parse");

        let vars: HashMap<&str, &str> = HashMap::from([
            ("CONVERGE_TARGET_HOME", "/srv/agent"),
            ("CONVERGE_REPORT_BACKEND", "s3"),
            ("CONVERGE_REPORT_BUCKET", "audit-bucket"),
        ]);
        ConfigParser::apply_env_overrides(&mut declaration, |k| {
            vars.get(k).map(|v| (*v).to_string())
        })
        .expect("overrides apply");

        assert_eq!(declaration.target.home, "/srv/agent");
        assert_eq!(declaration.report.backend, ReportBackend::S3);
        assert_eq!(declaration.report.bucket.as_deref(), Some("audit-bucket"));
    }

    #[test]
    fn test_unknown_backend_override_rejected() {
        let yaml = "target:\n  name: srv\n  home: /opt/srv\n";
        let mut declaration = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        let result = ConfigParser::apply_env_overrides(&mut declaration, |k| {
            (k == "CONVERGE_REPORT_BACKEND").then(|| String::from("ftp"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("converge.yaml"), "target: {}").expect("write");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("should find");
        assert_eq!(found, dir.path().join("converge.yaml"));
    }
}

//! Command-driven control plane.
//!
//! Drives the agent through its command line, configured entirely from the
//! declaration's `target` section. Nothing is read from or written to the
//! process environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::{AttrValue, CommandTemplates, ContentHasher, TargetConfig, expand_home};
use crate::error::ControlError;

use super::plane::{AgentControlPlane, ControlResult, ServiceStatus};

/// Default timeout for a single command, in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Timeout for a local port connect.
const PORT_CONNECT_TIMEOUT_MS: u64 = 500;

/// Control plane that shells out to the agent's own binary.
#[derive(Debug, Clone)]
pub struct CommandControlPlane {
    /// Installation home.
    home: PathBuf,
    /// Absolute path of the control binary.
    binary: PathBuf,
    /// Directory holding config blobs.
    config_dir: PathBuf,
    /// Argv templates.
    commands: CommandTemplates,
    /// Per-call timeout.
    timeout: Duration,
    /// Hasher for config blobs.
    hasher: ContentHasher,
}

impl CommandControlPlane {
    /// Creates a control plane for `target`.
    #[must_use]
    pub fn new(target: &TargetConfig) -> Self {
        let home = expand_home(&target.home);
        let binary = home.join(&target.binary);
        let config_dir = home.join(&target.config_dir);

        Self {
            home,
            binary,
            config_dir,
            commands: target.commands.clone(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            hasher: ContentHasher::new(),
        }
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the directory config blobs are written to.
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Returns the argv template for an operation.
    ///
    /// `install` and `uninstall` have no conventional default.
    fn template(&self, operation: &str) -> Option<Vec<String>> {
        let configured = match operation {
            "install" => &self.commands.install,
            "uninstall" => &self.commands.uninstall,
            "start" => &self.commands.start,
            "stop" => &self.commands.stop,
            "restart" => &self.commands.restart,
            "status" => &self.commands.status,
            "create_index" => &self.commands.create_index,
            "remove_index" => &self.commands.remove_index,
            "list_indexes" => &self.commands.list_indexes,
            _ => &None,
        };

        if let Some(argv) = configured {
            return Some(argv.clone());
        }

        let default: &[&str] = match operation {
            "start" => &["{bin}", "start"],
            "stop" => &["{bin}", "stop"],
            "restart" => &["{bin}", "restart"],
            "status" => &["{bin}", "status"],
            "create_index" => &["{bin}", "add", "index", "{name}"],
            "remove_index" => &["{bin}", "remove", "index", "{name}"],
            "list_indexes" => &["{bin}", "list", "index"],
            _ => return None,
        };

        Some(default.iter().map(|s| (*s).to_string()).collect())
    }

    /// Substitutes placeholders in a template.
    fn render(&self, template: &[String], name: Option<&str>) -> Vec<String> {
        let home = self.home.to_string_lossy();
        let bin = self.binary.to_string_lossy();

        template
            .iter()
            .map(|arg| {
                let arg = arg.replace("{home}", &home).replace("{bin}", &bin);
                match name {
                    Some(name) => arg.replace("{name}", name),
                    None => arg,
                }
            })
            .collect()
    }

    /// Builds the argv for an operation.
    fn argv(&self, operation: &str, name: Option<&str>) -> ControlResult<Vec<String>> {
        let template = self.template(operation).ok_or_else(|| ControlError::CommandFailed {
            operation: operation.to_string(),
            code: None,
            stderr: format!("no {operation} command configured for this target"),
        })?;

        Ok(self.render(&template, name))
    }

    /// Runs a command and returns its raw output.
    async fn run(&self, operation: &str, argv: &[String]) -> ControlResult<Output> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ControlError::CommandFailed {
                operation: operation.to_string(),
                code: None,
                stderr: String::from("empty command"),
            });
        };

        debug!("Running {operation}: {}", argv.join(" "));

        let workdir = if self.home.is_dir() {
            self.home.as_path()
        } else {
            Path::new("/")
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => Err(ControlError::Timeout {
                operation: operation.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }),
            Ok(Err(e)) => Err(ControlError::from_io(operation, &e)),
            Ok(Ok(output)) => {
                trace!("{operation} exited with {:?}", output.status.code());
                Ok(output)
            }
        }
    }

    /// Runs a command and fails on a non-zero exit, returning stdout.
    async fn run_checked(&self, operation: &str, argv: &[String]) -> ControlResult<String> {
        let output = self.run(operation, argv).await?;

        if !output.status.success() {
            return Err(ControlError::CommandFailed {
                operation: operation.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs a named operation without extra arguments.
    async fn simple(&self, operation: &str) -> ControlResult<()> {
        let argv = self.argv(operation, None)?;
        self.run_checked(operation, &argv).await.map(|_| ())
    }

    /// Resolves a config blob name under the config directory.
    fn config_path(&self, name: &str) -> ControlResult<PathBuf> {
        let file = Path::new(name);
        if file.is_absolute() || file.components().any(|c| c.as_os_str() == "..") {
            return Err(ControlError::PermissionDenied {
                message: format!("config name '{name}' escapes the config directory"),
            });
        }
        Ok(self.config_dir.join(file))
    }
}

#[async_trait]
impl AgentControlPlane for CommandControlPlane {
    async fn install(&self) -> ControlResult<()> {
        self.simple("install").await
    }

    async fn uninstall(&self) -> ControlResult<()> {
        self.simple("uninstall").await
    }

    async fn start(&self) -> ControlResult<()> {
        self.simple("start").await
    }

    async fn stop(&self) -> ControlResult<()> {
        self.simple("stop").await
    }

    async fn restart(&self) -> ControlResult<()> {
        self.simple("restart").await
    }

    async fn status(&self) -> ControlResult<ServiceStatus> {
        let installed = tokio::fs::try_exists(&self.binary)
            .await
            .map_err(|e| ControlError::from_io("status", &e))?;

        if !installed {
            return Ok(ServiceStatus::default());
        }

        let argv = self.argv("status", None)?;
        let output = self.run("status", &argv).await?;
        let running = output.status.success();
        let pid = if running {
            parse_pid(&String::from_utf8_lossy(&output.stdout))
        } else {
            None
        };

        Ok(ServiceStatus {
            installed,
            running,
            pid,
        })
    }

    async fn write_config(&self, name: &str, content: &[u8]) -> ControlResult<String> {
        let path = self.config_path(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ControlError::from_io("write_config", &e))?;
        }

        // write to a sibling temp file, then rename over the target
        let temp = path.with_extension("converge.tmp");
        tokio::fs::write(&temp, content)
            .await
            .map_err(|e| ControlError::from_io("write_config", &e))?;
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| ControlError::from_io("write_config", &e))?;

        debug!("Wrote config {}", path.display());
        Ok(self.hasher.hash_payload(content))
    }

    async fn read_config_hash(&self, name: &str) -> ControlResult<Option<String>> {
        let path = self.config_path(name)?;

        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Some(self.hasher.hash_payload(&content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ControlError::from_io("read_config_hash", &e)),
        }
    }

    async fn remove_config(&self, name: &str) -> ControlResult<()> {
        let path = self.config_path(name)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ControlError::from_io("remove_config", &e)),
        }
    }

    async fn create_index(
        &self,
        name: &str,
        params: &BTreeMap<String, AttrValue>,
    ) -> ControlResult<()> {
        let mut argv = self.argv("create_index", Some(name))?;
        for (key, value) in params {
            argv.push(format!("-{key}"));
            argv.push(value.to_string());
        }

        self.run_checked("create_index", &argv).await.map(|_| ())
    }

    async fn remove_index(&self, name: &str) -> ControlResult<()> {
        let argv = self.argv("remove_index", Some(name))?;
        self.run_checked("remove_index", &argv).await.map(|_| ())
    }

    async fn list_indexes(&self) -> ControlResult<Vec<String>> {
        let argv = self.argv("list_indexes", None)?;
        let stdout = self.run_checked("list_indexes", &argv).await?;

        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn port_listening(&self, port: u16) -> ControlResult<bool> {
        let connect = TcpStream::connect(("127.0.0.1", port));
        let listening = matches!(
            tokio::time::timeout(Duration::from_millis(PORT_CONNECT_TIMEOUT_MS), connect).await,
            Ok(Ok(_))
        );

        trace!("Port {port} listening: {listening}");
        Ok(listening)
    }
}

/// Extracts a process id from status output such as `agent is running (PID: 4242).`
fn parse_pid(output: &str) -> Option<u32> {
    let lower = output.to_ascii_lowercase();
    let start = lower.find("pid")? + 3;

    let digits: String = lower[start..]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();

    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target(home: &Path, commands: CommandTemplates) -> TargetConfig {
        TargetConfig {
            name: String::from("test"),
            home: home.to_string_lossy().into_owned(),
            binary: String::from("bin/agent"),
            config_dir: String::from("etc/system/local"),
            commands,
        }
    }

    fn argv(args: &[&str]) -> Option<Vec<String>> {
        Some(args.iter().map(|s| (*s).to_string()).collect())
    }

    fn install_binary(home: &Path) {
        std::fs::create_dir_all(home.join("bin")).expect("bin dir");
        std::fs::write(home.join("bin/agent"), "").expect("binary");
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("agent is running (PID: 4242)."), Some(4242));
        assert_eq!(parse_pid("pid=17\n"), Some(17));
        assert_eq!(parse_pid("agent is not running."), None);
    }

    #[test]
    fn test_default_templates_use_binary() {
        let dir = TempDir::new().expect("temp dir");
        let plane = CommandControlPlane::new(&target(dir.path(), CommandTemplates::default()));

        let argv = plane.argv("create_index", Some("main")).expect("argv");
        assert_eq!(argv[0], dir.path().join("bin/agent").to_string_lossy());
        assert_eq!(&argv[1..], ["add", "index", "main"]);

        assert!(plane.argv("install", None).is_err());
    }

    #[tokio::test]
    async fn test_status_when_not_installed() {
        let dir = TempDir::new().expect("temp dir");
        let plane = CommandControlPlane::new(&target(dir.path(), CommandTemplates::default()));

        let status = plane.status().await.expect("status");
        assert_eq!(status, ServiceStatus::default());
    }

    #[tokio::test]
    async fn test_status_running_with_pid() {
        let dir = TempDir::new().expect("temp dir");
        install_binary(dir.path());
        let commands = CommandTemplates {
            status: argv(&["sh", "-c", "echo 'agent is running (PID: 4242).'"]),
            ..CommandTemplates::default()
        };
        let plane = CommandControlPlane::new(&target(dir.path(), commands));

        let status = plane.status().await.expect("status");
        assert!(status.installed);
        assert!(status.running);
        assert_eq!(status.pid, Some(4242));
    }

    #[tokio::test]
    async fn test_status_stopped() {
        let dir = TempDir::new().expect("temp dir");
        install_binary(dir.path());
        let commands = CommandTemplates {
            status: argv(&["false"]),
            ..CommandTemplates::default()
        };
        let plane = CommandControlPlane::new(&target(dir.path(), commands));

        let status = plane.status().await.expect("status");
        assert!(status.installed);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_command_failure_carries_exit_code() {
        let dir = TempDir::new().expect("temp dir");
        let commands = CommandTemplates {
            stop: argv(&["sh", "-c", "echo boom >&2; exit 3"]),
            ..CommandTemplates::default()
        };
        let plane = CommandControlPlane::new(&target(dir.path(), commands));

        let err = plane.stop().await.expect_err("stop fails");
        assert_eq!(
            err,
            ControlError::CommandFailed {
                operation: String::from("stop"),
                code: Some(3),
                stderr: String::from("boom"),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_unreachable() {
        let dir = TempDir::new().expect("temp dir");
        let commands = CommandTemplates {
            start: argv(&["/nonexistent/agent-binary", "start"]),
            ..CommandTemplates::default()
        };
        let plane = CommandControlPlane::new(&target(dir.path(), commands));

        let err = plane.start().await.expect_err("start fails");
        assert!(matches!(err, ControlError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = TempDir::new().expect("temp dir");
        let commands = CommandTemplates {
            start: argv(&["sleep", "5"]),
            ..CommandTemplates::default()
        };
        let plane = CommandControlPlane::new(&target(dir.path(), commands))
            .with_timeout(Duration::from_millis(100));

        let err = plane.start().await.expect_err("start times out");
        assert!(matches!(err, ControlError::Timeout { ref operation, .. } if operation == "start"));
    }

    #[tokio::test]
    async fn test_create_index_appends_params() {
        let dir = TempDir::new().expect("temp dir");
        let commands = CommandTemplates {
            create_index: argv(&["sh", "-c", "echo \"$@\" > {home}/args.txt", "sh", "{name}"]),
            ..CommandTemplates::default()
        };
        let plane = CommandControlPlane::new(&target(dir.path(), commands));

        let params = BTreeMap::from([(String::from("maxDataSize"), AttrValue::from("auto"))]);
        plane.create_index("main", &params).await.expect("create index");

        let args = std::fs::read_to_string(dir.path().join("args.txt")).expect("args");
        assert_eq!(args.trim(), "main -maxDataSize auto");
    }

    #[tokio::test]
    async fn test_list_indexes_parses_lines() {
        let dir = TempDir::new().expect("temp dir");
        let commands = CommandTemplates {
            list_indexes: argv(&["printf", "main\n\n  history \n"]),
            ..CommandTemplates::default()
        };
        let plane = CommandControlPlane::new(&target(dir.path(), commands));

        let indexes = plane.list_indexes().await.expect("list");
        assert_eq!(indexes, vec!["main", "history"]);
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let plane = CommandControlPlane::new(&target(dir.path(), CommandTemplates::default()));

        assert_eq!(plane.read_config_hash("inputs.conf").await.expect("read"), None);

        let hash = plane
            .write_config("inputs.conf", b"[tcp://9997]\n")
            .await
            .expect("write");
        assert_eq!(hash, ContentHasher::new().hash_payload("[tcp://9997]\n"));
        assert!(plane.config_dir().join("inputs.conf").exists());
        assert_eq!(
            plane.read_config_hash("inputs.conf").await.expect("read"),
            Some(hash)
        );

        plane.remove_config("inputs.conf").await.expect("remove");
        plane.remove_config("inputs.conf").await.expect("remove twice");
        assert_eq!(plane.read_config_hash("inputs.conf").await.expect("read"), None);
    }

    #[tokio::test]
    async fn test_binary_config_is_hashed_as_bytes() {
        let dir = TempDir::new().expect("temp dir");
        let plane = CommandControlPlane::new(&target(dir.path(), CommandTemplates::default()));
        let bundle: &[u8] = &[0x1f, 0x8b, 0x08, 0x00, 0xff, 0xfe, 0x00, 0x80];

        let hash = plane
            .write_config("apps/search.tgz", bundle)
            .await
            .expect("write");
        assert_eq!(hash, ContentHasher::new().hash_payload(bundle));
        assert_eq!(
            plane.read_config_hash("apps/search.tgz").await.expect("read"),
            Some(hash)
        );

        // a blob changed on disk reports its new hash rather than an error
        tokio::fs::write(plane.config_dir().join("apps/search.tgz"), [0xc3_u8, 0x28])
            .await
            .expect("overwrite");
        assert_eq!(
            plane.read_config_hash("apps/search.tgz").await.expect("read"),
            Some(ContentHasher::new().hash_payload([0xc3_u8, 0x28]))
        );
    }

    #[tokio::test]
    async fn test_config_name_cannot_escape() {
        let dir = TempDir::new().expect("temp dir");
        let plane = CommandControlPlane::new(&target(dir.path(), CommandTemplates::default()));

        let err = plane
            .write_config("../outside.conf", b"x")
            .await
            .expect_err("rejected");
        assert!(matches!(err, ControlError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_port_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let dir = TempDir::new().expect("temp dir");
        let plane = CommandControlPlane::new(&target(dir.path(), CommandTemplates::default()));

        assert!(plane.port_listening(port).await.expect("probe"));
        drop(listener);
        assert!(!plane.port_listening(port).await.expect("probe"));
    }
}

//! Stateful in-memory control plane for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{AttrValue, ContentHasher};
use crate::error::ControlError;

use super::plane::{AgentControlPlane, ControlResult, ServiceStatus};

/// In-memory agent that records every mutating call.
#[derive(Debug, Default)]
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
}

#[derive(Debug, Default)]
struct FakeState {
    installed: bool,
    running: bool,
    configs: BTreeMap<String, Vec<u8>>,
    indexes: BTreeSet<String>,
    listening: BTreeSet<u16>,
    ports_while_running: BTreeSet<u16>,
    actions: Vec<String>,
    calls: usize,
    failures: HashMap<String, VecDeque<ControlError>>,
    ineffective: HashMap<String, u32>,
    unreachable: bool,
    delay: Option<Duration>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().expect("fake state lock");
        f(&mut state)
    }

    pub fn set_installed(&self, installed: bool) {
        self.with_state(|s| s.installed = installed);
    }

    pub fn set_running(&self, running: bool) {
        self.with_state(|s| s.running = running);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.with_state(|s| s.unreachable = unreachable);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.with_state(|s| s.delay = Some(delay));
    }

    /// Something unrelated to the agent listens on `port`.
    pub fn listen_on(&self, port: u16) {
        self.with_state(|s| {
            s.listening.insert(port);
        });
    }

    /// `port` listens whenever the service runs.
    pub fn serve_while_running(&self, port: u16) {
        self.with_state(|s| {
            s.ports_while_running.insert(port);
        });
    }

    pub fn add_index(&self, name: &str) {
        self.with_state(|s| {
            s.indexes.insert(name.to_string());
        });
    }

    pub fn put_config(&self, name: &str, content: &[u8]) {
        self.with_state(|s| {
            s.configs.insert(name.to_string(), content.to_vec());
        });
    }

    /// The next call to `operation` fails with `error`.
    pub fn fail_next(&self, operation: &str, error: ControlError) {
        self.with_state(|s| {
            s.failures
                .entry(operation.to_string())
                .or_default()
                .push_back(error);
        });
    }

    /// The next `times` calls to `operation` succeed without any effect.
    pub fn ineffective(&self, operation: &str, times: u32) {
        self.with_state(|s| {
            s.ineffective.insert(operation.to_string(), times);
        });
    }

    /// Mutating calls in order, e.g. `install`, `create_index(main)`.
    pub fn actions(&self) -> Vec<String> {
        self.with_state(|s| s.actions.clone())
    }

    /// Total number of calls, probes included.
    pub fn call_count(&self) -> usize {
        self.with_state(|s| s.calls)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.with_state(|s| s.indexes.contains(name))
    }

    pub fn config(&self, name: &str) -> Option<Vec<u8>> {
        self.with_state(|s| s.configs.get(name).cloned())
    }

    pub fn status_now(&self) -> ServiceStatus {
        self.with_state(|s| ServiceStatus {
            installed: s.installed,
            running: s.running,
            pid: None,
        })
    }

    /// Records a call and decides whether it takes effect.
    async fn enter(&self, operation: &str, logged: Option<String>) -> ControlResult<bool> {
        let delay = self.with_state(|s| s.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.with_state(|s| {
            s.calls += 1;
            if s.unreachable {
                return Err(ControlError::unreachable("agent management port closed"));
            }
            if let Some(entry) = logged {
                s.actions.push(entry);
            }
            if let Some(err) = s.failures.get_mut(operation).and_then(VecDeque::pop_front) {
                return Err(err);
            }
            match s.ineffective.get_mut(operation) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Ok(false)
                }
                _ => Ok(true),
            }
        })
    }
}

fn not_installed(operation: &str) -> ControlError {
    ControlError::CommandFailed {
        operation: operation.to_string(),
        code: Some(1),
        stderr: String::from("agent is not installed"),
    }
}

#[async_trait]
impl AgentControlPlane for FakeControlPlane {
    async fn install(&self) -> ControlResult<()> {
        if self.enter("install", Some(String::from("install"))).await? {
            self.with_state(|s| s.installed = true);
        }
        Ok(())
    }

    async fn uninstall(&self) -> ControlResult<()> {
        if self.enter("uninstall", Some(String::from("uninstall"))).await? {
            self.with_state(|s| {
                s.installed = false;
                s.running = false;
            });
        }
        Ok(())
    }

    async fn start(&self) -> ControlResult<()> {
        if self.enter("start", Some(String::from("start"))).await? {
            return self.with_state(|s| {
                if !s.installed {
                    return Err(not_installed("start"));
                }
                s.running = true;
                Ok(())
            });
        }
        Ok(())
    }

    async fn stop(&self) -> ControlResult<()> {
        if self.enter("stop", Some(String::from("stop"))).await? {
            self.with_state(|s| s.running = false);
        }
        Ok(())
    }

    async fn restart(&self) -> ControlResult<()> {
        if self.enter("restart", Some(String::from("restart"))).await? {
            return self.with_state(|s| {
                if !s.installed {
                    return Err(not_installed("restart"));
                }
                s.running = true;
                Ok(())
            });
        }
        Ok(())
    }

    async fn status(&self) -> ControlResult<ServiceStatus> {
        self.enter("status", None).await?;
        Ok(self.with_state(|s| ServiceStatus {
            installed: s.installed,
            running: s.running,
            pid: s.running.then_some(4242),
        }))
    }

    async fn write_config(&self, name: &str, content: &[u8]) -> ControlResult<String> {
        let applied = self
            .enter("write_config", Some(format!("write_config({name})")))
            .await?;
        if applied {
            self.put_config(name, content);
        }
        Ok(ContentHasher::new().hash_payload(content))
    }

    async fn read_config_hash(&self, name: &str) -> ControlResult<Option<String>> {
        self.enter("read_config_hash", None).await?;
        Ok(self
            .config(name)
            .map(|content| ContentHasher::new().hash_payload(content)))
    }

    async fn remove_config(&self, name: &str) -> ControlResult<()> {
        if self
            .enter("remove_config", Some(format!("remove_config({name})")))
            .await?
        {
            self.with_state(|s| {
                s.configs.remove(name);
            });
        }
        Ok(())
    }

    async fn create_index(
        &self,
        name: &str,
        _params: &BTreeMap<String, AttrValue>,
    ) -> ControlResult<()> {
        if self
            .enter("create_index", Some(format!("create_index({name})")))
            .await?
        {
            self.add_index(name);
        }
        Ok(())
    }

    async fn remove_index(&self, name: &str) -> ControlResult<()> {
        if self
            .enter("remove_index", Some(format!("remove_index({name})")))
            .await?
        {
            self.with_state(|s| {
                s.indexes.remove(name);
            });
        }
        Ok(())
    }

    async fn list_indexes(&self) -> ControlResult<Vec<String>> {
        self.enter("list_indexes", None).await?;
        Ok(self.with_state(|s| s.indexes.iter().cloned().collect()))
    }

    async fn port_listening(&self, port: u16) -> ControlResult<bool> {
        self.enter("port_listening", None).await?;
        Ok(self.with_state(|s| {
            s.listening.contains(&port) || (s.running && s.ports_while_running.contains(&port))
        }))
    }
}

//! In-memory container runtime for tests.
//!
//! Tracks containers by id and name, enforces unique names and unique
//! published host ports among running containers, and lets tests inject
//! failures for specific operations.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::deploy::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerSummary, RuntimeError,
};

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Start,
    Stop,
    Restart,
    Remove,
    Inspect,
    List,
    EnsureImage,
    Logs,
}

/// A container held by the mock runtime
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub restarts: u32,
}

/// Fake container runtime
#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<HashMap<String, MockContainer>>,
    failures: Mutex<HashMap<MockOp, VecDeque<RuntimeError>>>,
    pulled: Mutex<Vec<String>>,
    next_id: AtomicU64,
    list_fails: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call of `op` with `error`. Queued errors are consumed in order.
    pub async fn fail_next(&self, op: MockOp, error: RuntimeError) {
        self.failures
            .lock()
            .await
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Make every `list` call fail until reset
    pub fn set_list_failing(&self, failing: bool) {
        self.list_fails.store(failing, Ordering::SeqCst);
    }

    /// Drop a container as if it had vanished from the daemon
    pub async fn vanish(&self, id: &str) {
        self.containers.lock().await.remove(id);
    }

    /// Insert a running container that nothing created through `create`
    pub async fn adopt(&self, spec: ContainerSpec) -> String {
        let id = self.fresh_id();
        self.containers.lock().await.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                spec,
                running: true,
                restarts: 0,
            },
        );
        id
    }

    pub async fn container(&self, id: &str) -> Option<MockContainer> {
        self.containers.lock().await.get(id).cloned()
    }

    pub async fn container_by_name(&self, name: &str) -> Option<MockContainer> {
        self.containers
            .lock()
            .await
            .values()
            .find(|c| c.spec.name == name)
            .cloned()
    }

    pub async fn containers(&self) -> Vec<MockContainer> {
        self.containers.lock().await.values().cloned().collect()
    }

    pub async fn pulled_images(&self) -> Vec<String> {
        self.pulled.lock().await.clone()
    }

    fn fresh_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{:064x}", n + 1)
    }

    async fn injected(&self, op: MockOp) -> Result<(), RuntimeError> {
        match self
            .failures
            .lock()
            .await
            .get_mut(&op)
            .and_then(|queue| queue.pop_front())
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn resolve<'a>(
        containers: &'a mut HashMap<String, MockContainer>,
        id_or_name: &str,
    ) -> Option<&'a mut MockContainer> {
        containers
            .values_mut()
            .find(|c| c.id == id_or_name || c.spec.name == id_or_name)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.injected(MockOp::Create).await?;

        let mut containers = self.containers.lock().await;
        if containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::CommandFailed {
                command: "create".to_string(),
                message: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            });
        }

        let id = self.fresh_id();
        containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                restarts: 0,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.injected(MockOp::Start).await?;

        let mut containers = self.containers.lock().await;
        let host_port = match containers.get(id) {
            Some(c) => c.spec.port.host_port,
            None => return Err(RuntimeError::NotFound(format!("No such container: {}", id))),
        };
        let taken = containers
            .values()
            .any(|c| c.id != id && c.running && c.spec.port.host_port == host_port);
        if taken {
            return Err(RuntimeError::PortInUse(format!(
                "Bind for 127.0.0.1:{} failed: port is already allocated",
                host_port
            )));
        }
        if let Some(container) = containers.get_mut(id) {
            container.running = true;
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        self.injected(MockOp::Stop).await?;

        let mut containers = self.containers.lock().await;
        match Self::resolve(&mut containers, id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("No such container: {}", id))),
        }
    }

    async fn restart(&self, id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        self.injected(MockOp::Restart).await?;

        let mut containers = self.containers.lock().await;
        match Self::resolve(&mut containers, id) {
            Some(container) => {
                container.running = true;
                container.restarts += 1;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("No such container: {}", id))),
        }
    }

    async fn remove(&self, id_or_name: &str, force: bool) -> Result<(), RuntimeError> {
        self.injected(MockOp::Remove).await?;

        let mut containers = self.containers.lock().await;
        let found = containers
            .values()
            .find(|c| c.id == id_or_name || c.spec.name == id_or_name)
            .map(|c| (c.id.clone(), c.running));
        match found {
            None => Err(RuntimeError::NotFound(format!("No such container: {}", id_or_name))),
            Some((_, true)) if !force => Err(RuntimeError::CommandFailed {
                command: "rm".to_string(),
                message: "cannot remove a running container".to_string(),
            }),
            Some((id, _)) => {
                containers.remove(&id);
                Ok(())
            }
        }
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        self.injected(MockOp::Inspect).await?;

        let mut containers = self.containers.lock().await;
        Ok(Self::resolve(&mut containers, id).map(|c| ContainerInfo {
            id: c.id.clone(),
            name: c.spec.name.clone(),
            running: c.running,
            status: if c.running { "running" } else { "exited" }.to_string(),
        }))
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        if self.list_fails.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("daemon not responding".to_string()));
        }
        self.injected(MockOp::List).await?;

        Ok(self
            .containers
            .lock()
            .await
            .values()
            .filter(|c| c.spec.name.starts_with(name_prefix))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.spec.name.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
            })
            .collect())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.injected(MockOp::EnsureImage).await?;

        let mut pulled = self.pulled.lock().await;
        if !pulled.iter().any(|i| i == image) {
            pulled.push(image.to_string());
        }
        Ok(())
    }

    async fn logs(&self, id: &str, tail: usize, timestamps: bool) -> Result<String, RuntimeError> {
        self.injected(MockOp::Logs).await?;

        let mut containers = self.containers.lock().await;
        let container = Self::resolve(&mut containers, id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {}", id)))?;
        let lines: Vec<String> = (0..tail.min(3))
            .map(|i| {
                if timestamps {
                    format!("2026-01-01T00:00:0{}Z {} line {}", i, container.spec.name, i)
                } else {
                    format!("{} line {}", container.spec.name, i)
                }
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

//! Container runtime interface

pub mod docker;
pub mod mock;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from container runtime operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// Container or image does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Host port could not be bound
    #[error("port already in use: {0}")]
    PortInUse(String),

    /// Runtime rejected the command
    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Runtime could not be reached
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Map a runtime error message onto the error taxonomy.
pub fn classify_failure(command: &str, message: &str) -> RuntimeError {
    let lower = message.to_lowercase();
    if lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("no such image")
    {
        RuntimeError::NotFound(message.trim().to_string())
    } else if lower.contains("port is already allocated")
        || lower.contains("address already in use")
    {
        RuntimeError::PortInUse(message.trim().to_string())
    } else if lower.contains("cannot connect to the docker daemon") {
        RuntimeError::Unavailable(message.trim().to_string())
    } else {
        RuntimeError::CommandFailed {
            command: command.to_string(),
            message: message.trim().to_string(),
        }
    }
}

/// Host directory mounted into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Published port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Everything needed to create one agent container
#[derive(Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    pub binds: Vec<BindMount>,
    pub port: PortMapping,
    pub memory_mb: u64,
    pub cpus: f64,
    pub restart_max_retries: u32,
}

impl ContainerSpec {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ContainerSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("env", &env_keys)
            .field("labels", &self.labels)
            .field("binds", &self.binds)
            .field("port", &self.port)
            .field("memory_mb", &self.memory_mb)
            .field("cpus", &self.cpus)
            .field("restart_max_retries", &self.restart_max_retries)
            .finish()
    }
}

/// A container as reported by `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: String,
}

/// A container as reported by `inspect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub status: String,
}

/// Local container daemon
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop gracefully, killing after `timeout`
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn restart(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Remove by id or name
    async fn remove(&self, id_or_name: &str, force: bool) -> Result<(), RuntimeError>;

    /// `None` when the container does not exist
    async fn inspect(&self, id: &str) -> Result<Option<ContainerInfo>, RuntimeError>;

    /// All containers, running or not, whose name starts with `name_prefix`
    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Pull `image` unless it is already present locally
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Last `tail` log lines, timestamped when asked
    async fn logs(&self, id: &str, tail: usize, timestamps: bool) -> Result<String, RuntimeError>;
}

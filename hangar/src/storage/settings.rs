//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Environment variable holding the hex-encoded master key
pub const MASTER_KEY_ENV: &str = "HANGAR_MASTER_KEY";

/// Control plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily-rolling log files under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Listener configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Host port range handed to containers
    #[serde(default)]
    pub ports: PortSettings,

    /// Container specification defaults
    #[serde(default)]
    pub container: ContainerSettings,

    /// Health checker configuration
    #[serde(default)]
    pub health: HealthSettings,

    /// Reconciler configuration
    #[serde(default)]
    pub reaper: ReaperSettings,

    /// Route cache TTL in milliseconds
    #[serde(default = "default_route_cache_ttl_ms")]
    pub route_cache_ttl_ms: u64,

    /// Persist deployment records to a snapshot file
    #[serde(default = "default_true")]
    pub persist_store: bool,
}

fn default_true() -> bool {
    true
}

fn default_route_cache_ttl_ms() -> u64 {
    5_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            server: ServerSettings::default(),
            ports: PortSettings::default(),
            container: ContainerSettings::default(),
            health: HealthSettings::default(),
            reaper: ReaperSettings::default(),
            route_cache_ttl_ms: default_route_cache_ttl_ms(),
            persist_store: true,
        }
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Host port range settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSettings {
    #[serde(default = "default_port_min")]
    pub min: u16,

    #[serde(default = "default_port_max")]
    pub max: u16,
}

fn default_port_min() -> u16 {
    23000
}

fn default_port_max() -> u16 {
    23999
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
        }
    }
}

/// Container settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    /// Agent image reference
    #[serde(default = "default_image")]
    pub image: String,

    /// Prefix of every managed container name
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Port the agent gateway listens on inside the container
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// Memory ceiling in megabytes
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// CPU ceiling in cores
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// Restart policy retry cap
    #[serde(default = "default_restart_max_retries")]
    pub restart_max_retries: u32,

    /// Graceful stop timeout in seconds
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Docker CLI binary
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
}

fn default_image() -> String {
    "ghcr.io/hangar-dev/agent:latest".to_string()
}

fn default_name_prefix() -> String {
    "hangar-agent-".to_string()
}

fn default_service_port() -> u16 {
    18789
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_cpus() -> f64 {
    1.0
}

fn default_restart_max_retries() -> u32 {
    5
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            name_prefix: default_name_prefix(),
            service_port: default_service_port(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
            restart_max_retries: default_restart_max_retries(),
            stop_timeout_secs: default_stop_timeout_secs(),
            docker_bin: default_docker_bin(),
        }
    }
}

/// Health checker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Give up on a deployment that never becomes reachable. Unset means
    /// poll until someone acts on it.
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
}

fn default_health_interval_ms() -> u64 {
    2_000
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            startup_timeout_secs: None,
        }
    }
}

/// Reconciler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_pause_ms() -> u64 {
    100
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reaper_interval_secs(),
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
        }
    }
}

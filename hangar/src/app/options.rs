//! Application configuration options

use std::time::Duration;

use crate::deploy::{health, manager};
use crate::proxy::router;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::reaper;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Host port range handed to containers
    pub ports: PortRangeOptions,

    /// Docker CLI binary
    pub docker_bin: String,

    /// Enable the reaper worker
    pub enable_reaper: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Container manager options
    pub manager: manager::Options,

    /// Health checker options
    pub health: health::Options,

    /// Reaper worker options
    pub reaper: reaper::Options,

    /// Reverse proxy options
    pub proxy: router::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            ports: PortRangeOptions::default(),
            docker_bin: "docker".to_string(),
            enable_reaper: true,
            server: ServerOptions::default(),
            manager: manager::Options::default(),
            health: health::Options::default(),
            reaper: reaper::Options::default(),
            proxy: router::Options::default(),
        }
    }
}

impl AppOptions {
    /// Derive options from the settings file
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let container = &settings.container;
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions {
                layout,
                persist_store: settings.persist_store,
                route_cache_ttl: Duration::from_millis(settings.route_cache_ttl_ms),
                ..Default::default()
            },
            ports: PortRangeOptions {
                min: settings.ports.min,
                max: settings.ports.max,
            },
            docker_bin: container.docker_bin.clone(),
            enable_reaper: settings.reaper.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            manager: manager::Options {
                image: container.image.clone(),
                name_prefix: container.name_prefix.clone(),
                service_port: container.service_port,
                memory_mb: container.memory_mb,
                cpus: container.cpus,
                restart_max_retries: container.restart_max_retries,
                stop_timeout: Duration::from_secs(container.stop_timeout_secs),
                ..Default::default()
            },
            health: health::Options {
                interval: Duration::from_millis(settings.health.interval_ms),
                probe_timeout: Duration::from_millis(settings.health.probe_timeout_ms),
                startup_timeout: settings.health.startup_timeout_secs.map(Duration::from_secs),
                ..Default::default()
            },
            reaper: reaper::Options {
                interval: Duration::from_secs(settings.reaper.interval_secs),
                batch_size: settings.reaper.batch_size,
                batch_pause: Duration::from_millis(settings.reaper.batch_pause_ms),
                name_prefix: container.name_prefix.clone(),
            },
            proxy: router::Options::default(),
        }
    }
}

/// Lifecycle options for the control plane
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Snapshot deployment records to disk
    pub persist_store: bool,

    /// Route cache TTL
    pub route_cache_ttl: Duration,

    /// Maximum route cache entries
    pub route_cache_capacity: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            persist_store: true,
            route_cache_ttl: Duration::from_secs(5),
            route_cache_capacity: 10_000,
        }
    }
}

/// Host port range
#[derive(Debug, Clone, Copy)]
pub struct PortRangeOptions {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRangeOptions {
    fn default() -> Self {
        Self {
            min: 23000,
            max: 23999,
        }
    }
}

/// HTTP listener options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

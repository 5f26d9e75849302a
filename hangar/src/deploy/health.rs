//! Readiness polling for freshly started containers.
//!
//! One poller task per deployment id. A poller probes the published port
//! until a TCP connect succeeds, then promotes the deployment to `healthy`,
//! drops its cached route and ends. Registering an id again aborts the previous poller; the
//! container manager deregisters on stop and remove.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::route::RouteCache;
use crate::deploy::fsm::{StateMachine, TransitionOptions};
use crate::models::deployment::DeploymentStatus;

/// Health checker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Delay between probes
    pub interval: Duration,

    /// Timeout of a single TCP connect
    pub probe_timeout: Duration,

    /// Move to `error` if the container never becomes reachable
    pub startup_timeout: Option<Duration>,

    /// Host the published ports are bound on
    pub probe_host: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(1),
            startup_timeout: None,
            probe_host: "127.0.0.1".to_string(),
        }
    }
}

struct Poller {
    generation: u64,
    port: u16,
    handle: JoinHandle<()>,
}

type Pollers = Arc<Mutex<HashMap<String, Poller>>>;

/// Owns every running readiness poller
pub struct HealthChecker {
    fsm: Arc<StateMachine>,
    routes: Arc<RouteCache>,
    options: Options,
    pollers: Pollers,
    generation: AtomicU64,
}

/// Whether a TCP connection to `host:port` succeeds within `timeout`
pub async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

impl HealthChecker {
    pub fn new(fsm: Arc<StateMachine>, routes: Arc<RouteCache>, options: Options) -> Self {
        Self {
            fsm,
            routes,
            options,
            pollers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Start polling `port` for `deployment_id`, replacing any existing poller.
    pub fn register(&self, deployment_id: &str, port: u16) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // held across the spawn so the poller cannot finish before its entry exists
        let mut pollers = self.pollers.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(poll(
            deployment_id.to_string(),
            port,
            generation,
            self.options.clone(),
            self.fsm.clone(),
            self.routes.clone(),
            self.pollers.clone(),
        ));
        let previous = pollers.insert(
            deployment_id.to_string(),
            Poller {
                generation,
                port,
                handle,
            },
        );
        drop(pollers);
        if let Some(previous) = previous {
            previous.handle.abort();
            debug!(
                deployment_id = %deployment_id,
                old_port = previous.port,
                "Replaced health poller"
            );
        }
        info!(deployment_id = %deployment_id, port, "Registered health poller");
    }

    /// Stop polling `deployment_id`. Returns whether a poller was running.
    pub fn deregister(&self, deployment_id: &str) -> bool {
        let removed = self
            .pollers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(deployment_id);
        match removed {
            Some(poller) => {
                poller.handle.abort();
                debug!(deployment_id = %deployment_id, "Deregistered health poller");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, deployment_id: &str) -> bool {
        self.pollers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(deployment_id)
    }

    pub fn registered_count(&self) -> usize {
        self.pollers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Abort every poller
    pub fn shutdown(&self) {
        let drained: Vec<(String, Poller)> = self
            .pollers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, poller) in &drained {
            poller.handle.abort();
        }
        info!(count = drained.len(), "Health checker stopped");
    }
}

/// Remove our own entry unless a newer registration replaced it
fn finish(pollers: &Pollers, deployment_id: &str, generation: u64) -> bool {
    let mut pollers = pollers.lock().unwrap_or_else(|e| e.into_inner());
    match pollers.get(deployment_id) {
        Some(poller) if poller.generation == generation => {
            pollers.remove(deployment_id);
            true
        }
        _ => false,
    }
}

async fn poll(
    deployment_id: String,
    port: u16,
    generation: u64,
    options: Options,
    fsm: Arc<StateMachine>,
    routes: Arc<RouteCache>,
    pollers: Pollers,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(options.interval);

    loop {
        ticker.tick().await;

        if probe(&options.probe_host, port, options.probe_timeout).await {
            if !finish(&pollers, &deployment_id, generation) {
                return;
            }
            match fsm
                .transition_to(&deployment_id, DeploymentStatus::Healthy, TransitionOptions::default())
                .await
            {
                Ok(updated) => {
                    routes.invalidate(&updated.subdomain);
                    info!(
                        deployment_id = %deployment_id,
                        port,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Deployment is healthy"
                    );
                }
                Err(e) => warn!(
                    deployment_id = %deployment_id,
                    error = %e,
                    "Container reachable but deployment could not be marked healthy"
                ),
            }
            return;
        }

        if let Some(limit) = options.startup_timeout {
            if started.elapsed() >= limit {
                if !finish(&pollers, &deployment_id, generation) {
                    return;
                }
                let message = format!(
                    "Agent did not become reachable within {}s",
                    limit.as_secs()
                );
                warn!(deployment_id = %deployment_id, port, "{}", message);
                match fsm
                    .transition_to(
                        &deployment_id,
                        DeploymentStatus::Error,
                        TransitionOptions::error(message),
                    )
                    .await
                {
                    Ok(updated) => {
                        routes.invalidate(&updated.subdomain);
                    }
                    Err(e) => {
                        warn!(deployment_id = %deployment_id, error = %e, "Failed to record startup timeout")
                    }
                }
                return;
            }
        }

        debug!(deployment_id = %deployment_id, port, "Not reachable yet");
    }
}

//! Reconciler for deployments whose container is gone.
//!
//! A sweep lists the managed containers, then demotes every `healthy` or
//! `starting` deployment whose recorded container is not among them. It
//! never creates or starts containers.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::cache::route::RouteCache;
use crate::deploy::fsm::{StateMachine, TransitionOptions};
use crate::deploy::runtime::ContainerRuntime;
use crate::errors::HangarError;
use crate::models::deployment::{Deployment, DeploymentStatus};
use crate::store::DeploymentFilter;

/// Message recorded on a demoted deployment
pub const ZOMBIE_MESSAGE: &str = "Container died unexpectedly";

/// Reaper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between sweeps
    pub interval: Duration,

    /// Deployments corrected concurrently
    pub batch_size: usize,

    /// Pause between batches
    pub batch_pause: Duration,

    /// Prefix of managed container names
    pub name_prefix: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 10,
            batch_pause: Duration::from_millis(100),
            name_prefix: "hangar-agent-".to_string(),
        }
    }
}

/// Counts of one completed sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub reaped: Vec<String>,
    pub failed: usize,
}

/// Result of a sweep request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another sweep was still running
    Skipped,
    Completed(SweepReport),
}

pub struct Reaper {
    fsm: Arc<StateMachine>,
    runtime: Arc<dyn ContainerRuntime>,
    routes: Arc<RouteCache>,
    options: Options,
    running: AtomicBool,
}

/// Clears the running flag when a sweep ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Reaper {
    pub fn new(
        fsm: Arc<StateMachine>,
        runtime: Arc<dyn ContainerRuntime>,
        routes: Arc<RouteCache>,
        options: Options,
    ) -> Self {
        Self {
            fsm,
            runtime,
            routes,
            options,
            running: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one sweep unless one is already in progress
    pub async fn sweep(&self) -> Result<SweepOutcome, HangarError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Previous reaper sweep still running, skipping this tick");
            return Ok(SweepOutcome::Skipped);
        }
        let _guard = RunningGuard(&self.running);

        self.sweep_inner().await.map(SweepOutcome::Completed)
    }

    async fn sweep_inner(&self) -> Result<SweepReport, HangarError> {
        // a listing failure must abort before any record is touched
        let containers = self.runtime.list(&self.options.name_prefix).await?;
        let live: HashSet<String> = containers
            .into_iter()
            .flat_map(|c| [c.id, c.name])
            .collect();

        let filter = DeploymentFilter {
            status_in: Some(vec![DeploymentStatus::Healthy, DeploymentStatus::Starting]),
            has_container_ref: Some(true),
            ..Default::default()
        };
        let candidates = self.fsm.store().find_many(&filter).await?;

        let zombies: Vec<Deployment> = candidates
            .iter()
            .filter(|d| {
                d.container_ref
                    .as_ref()
                    .map(|r| !live.contains(r))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let mut report = SweepReport {
            checked: candidates.len(),
            ..Default::default()
        };

        let batch_size = self.options.batch_size.max(1);
        for (index, batch) in zombies.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.options.batch_pause).await;
            }
            let results = join_all(batch.iter().map(|d| self.demote(d))).await;
            for (deployment, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => report.reaped.push(deployment.id.clone()),
                    Err(e) => {
                        report.failed += 1;
                        warn!(deployment_id = %deployment.id, error = %e, "Failed to demote zombie deployment");
                    }
                }
            }
        }

        if report.reaped.is_empty() {
            debug!(checked = report.checked, "Reaper sweep found no zombies");
        } else {
            info!(
                checked = report.checked,
                reaped = report.reaped.len(),
                failed = report.failed,
                "Reaper sweep demoted zombie deployments"
            );
        }
        Ok(report)
    }

    async fn demote(&self, deployment: &Deployment) -> Result<(), HangarError> {
        let mut options = TransitionOptions::error(ZOMBIE_MESSAGE).releasing_container();
        options.expected_container_ref = deployment.container_ref.clone();

        self.fsm
            .transition_to(&deployment.id, DeploymentStatus::Error, options)
            .await?;
        self.routes.invalidate(&deployment.subdomain);
        warn!(
            deployment_id = %deployment.id,
            container_ref = ?deployment.container_ref,
            "Container missing at runtime, deployment marked as error"
        );
        Ok(())
    }
}

/// Run the reaper worker until shutdown
pub async fn run(
    reaper: Arc<Reaper>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!(
        interval_secs = reaper.options().interval.as_secs(),
        "Reaper worker starting..."
    );

    let mut ticker = tokio::time::interval(reaper.options().interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reaper worker shutting down...");
                return;
            }
            _ = ticker.tick() => {}
        }

        // detached so a slow sweep cannot delay the next tick; the running
        // flag turns overlapping ticks into skips
        let reaper = reaper.clone();
        tokio::spawn(async move {
            if let Err(e) = reaper.sweep().await {
                error!(error = %e, "Reaper sweep aborted");
            }
        });
    }
}

//! Container lifecycle manager
//!
//! Turns a deployment plus its opened secrets into a running container and
//! drives the record through `configuring -> provisioning -> starting`. Every
//! failure path removes what was created and ends in an `error` transition.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::deploy::artifacts::{self, CONFIG_MOUNT, WORKSPACE_MOUNT};
use crate::deploy::fsm::{can_transition, StateMachine, TransitionOptions};
use crate::deploy::health::HealthChecker;
use crate::deploy::ports::PortAllocator;
use crate::deploy::runtime::{
    BindMount, ContainerRuntime, ContainerSpec, PortMapping, RuntimeError,
};
use crate::errors::HangarError;
use crate::models::deployment::{Deployment, DeploymentStatus, ModelSelection, SecretFields};
use crate::storage::layout::StorageLayout;
use crate::store::{DeploymentUpdate, StoreError, UpdateGuard};

/// Container manager options
#[derive(Debug, Clone)]
pub struct Options {
    pub image: String,
    pub name_prefix: String,
    pub service_port: u16,
    pub memory_mb: u64,
    pub cpus: f64,
    pub restart_max_retries: u32,
    pub stop_timeout: Duration,

    /// Full spawn attempts when the runtime reports the host port taken
    pub max_spawn_attempts: u32,

    /// Guarded reservations tried before the port is force-written
    pub max_reserve_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            image: "ghcr.io/hangar-dev/agent:latest".to_string(),
            name_prefix: "hangar-agent-".to_string(),
            service_port: 18789,
            memory_mb: 2048,
            cpus: 1.0,
            restart_max_retries: 5,
            stop_timeout: Duration::from_secs(10),
            max_spawn_attempts: 2,
            max_reserve_attempts: 3,
        }
    }
}

/// What a spawn attempt has acquired so far
#[derive(Debug, Default)]
struct SpawnProgress {
    port: Option<u16>,
    container_id: Option<String>,
}

pub struct ContainerManager {
    fsm: Arc<StateMachine>,
    ports: Arc<PortAllocator>,
    runtime: Arc<dyn ContainerRuntime>,
    health: Arc<HealthChecker>,
    layout: StorageLayout,
    options: Options,
}

fn ignore_not_found(result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match result {
        Err(RuntimeError::NotFound(_)) => Ok(()),
        other => other,
    }
}

impl ContainerManager {
    /// Record a failure on the deployment. A failed write is logged, never dropped.
    async fn record_failure(&self, deployment_id: &str, message: String) {
        if let Err(e) = self
            .fsm
            .transition_to(
                deployment_id,
                DeploymentStatus::Error,
                TransitionOptions::error(message),
            )
            .await
        {
            error!(deployment_id = %deployment_id, error = %e, "Failed to record deployment error");
        }
    }

    pub fn new(
        fsm: Arc<StateMachine>,
        ports: Arc<PortAllocator>,
        runtime: Arc<dyn ContainerRuntime>,
        health: Arc<HealthChecker>,
        layout: StorageLayout,
        options: Options,
    ) -> Self {
        Self {
            fsm,
            ports,
            runtime,
            health,
            layout,
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Deterministic container name of a deployment
    pub fn container_name(&self, deployment_id: &str) -> String {
        format!("{}{}", self.options.name_prefix, deployment_id)
    }

    /// Create and start the container of a deployment.
    ///
    /// `secrets` must already be opened. A runtime-level port collision
    /// restarts the whole sequence with a fresh port, up to
    /// `max_spawn_attempts` times. Returns the container id.
    pub async fn create_and_start(
        &self,
        deployment_id: &str,
        secrets: &SecretFields,
        model: &ModelSelection,
    ) -> Result<String, HangarError> {
        let max_attempts = self.options.max_spawn_attempts.max(1);
        let mut attempt = 1;
        loop {
            let mut progress = SpawnProgress::default();
            match self
                .spawn_attempt(deployment_id, secrets, model, &mut progress)
                .await
            {
                Ok(container_id) => return Ok(container_id),
                Err(e) => {
                    self.cleanup_failed_spawn(deployment_id, &progress, &e).await;
                    if e.is_port_collision() && attempt < max_attempts {
                        warn!(
                            deployment_id = %deployment_id,
                            attempt,
                            port = ?progress.port,
                            "Host port collided at the runtime, retrying with a fresh port"
                        );
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn spawn_attempt(
        &self,
        deployment_id: &str,
        secrets: &SecretFields,
        model: &ModelSelection,
        progress: &mut SpawnProgress,
    ) -> Result<String, HangarError> {
        // 1. leftovers of a crashed attempt
        let name = self.container_name(deployment_id);
        match self.runtime.remove(&name, true).await {
            Ok(()) => info!(deployment_id = %deployment_id, container = %name, "Removed leftover container"),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!(deployment_id = %deployment_id, error = %e, "Could not remove leftover container"),
        }

        // 2. stale port and container ref
        self.fsm
            .store()
            .update_one(deployment_id, &UpdateGuard::none(), &DeploymentUpdate::release_container())
            .await?
            .ok_or_else(|| HangarError::NotFound(format!("deployment {}", deployment_id)))?;

        // 3. port
        self.fsm
            .transition_via_error(
                deployment_id,
                DeploymentStatus::Configuring,
                "Redeploy requested",
                TransitionOptions::step("Allocating port"),
            )
            .await?;
        let port = self.reserve_port(deployment_id, progress).await?;

        // 4. configuration artifacts
        let deployment = self
            .fsm
            .transition_to(
                deployment_id,
                DeploymentStatus::Configuring,
                TransitionOptions::step("Writing configuration"),
            )
            .await?;
        artifacts::write_artifacts(
            &self.layout.deployment(deployment_id),
            &deployment,
            secrets,
            model,
            self.options.service_port,
        )
        .await?;

        // 5. image
        self.fsm
            .transition_to(
                deployment_id,
                DeploymentStatus::Provisioning,
                TransitionOptions::step("Pulling image"),
            )
            .await?;
        self.runtime.ensure_image(&self.options.image).await?;

        // 6-7. container
        self.fsm.set_step(deployment_id, "Creating container").await?;
        let spec = self.container_spec(&deployment, secrets, model, port);
        let container_id = self.runtime.create(&spec).await?;
        progress.container_id = Some(container_id.clone());
        self.runtime.start(&container_id).await?;

        let update = DeploymentUpdate {
            container_ref: Some(Some(container_id.clone())),
            internal_port: Some(Some(port)),
            ..Default::default()
        };
        self.fsm
            .store()
            .update_one(
                deployment_id,
                &UpdateGuard::status(DeploymentStatus::Provisioning),
                &update,
            )
            .await?
            .ok_or_else(|| {
                HangarError::Conflict(format!(
                    "deployment {} changed while its container was starting",
                    deployment_id
                ))
            })?;

        // 8. readiness
        self.fsm
            .transition_to(
                deployment_id,
                DeploymentStatus::Starting,
                TransitionOptions::step("Waiting for agent"),
            )
            .await?;
        self.health.register(deployment_id, port);

        info!(
            deployment_id = %deployment_id,
            container_id = %container_id,
            port,
            "Container started"
        );
        Ok(container_id)
    }

    /// Allocate and persist a port on a `configuring` record.
    ///
    /// Store-level collisions are retried with a fresh port. When every
    /// guarded attempt collided the port is written without the status
    /// guard; the store's uniqueness check still applies to that write.
    async fn reserve_port(
        &self,
        deployment_id: &str,
        progress: &mut SpawnProgress,
    ) -> Result<u16, HangarError> {
        for attempt in 1..=self.options.max_reserve_attempts {
            let port = self.ports.allocate().await?;
            progress.port = Some(port);

            if self.ports.reserve(deployment_id, port).await? {
                return Ok(port);
            }
            self.ports.release(port).await;
            progress.port = None;

            let current = self.fsm.load(deployment_id).await?;
            if current.status != DeploymentStatus::Configuring {
                return Err(HangarError::Conflict(format!(
                    "deployment {} left configuring during port reservation (now {})",
                    deployment_id, current.status
                )));
            }
            debug!(deployment_id = %deployment_id, port, attempt, "Port reservation collided");
        }

        let port = self.ports.allocate().await?;
        progress.port = Some(port);
        warn!(deployment_id = %deployment_id, port, "Force-writing port after repeated collisions");

        let update = DeploymentUpdate {
            internal_port: Some(Some(port)),
            ..Default::default()
        };
        let result = self
            .fsm
            .store()
            .update_one(deployment_id, &UpdateGuard::none(), &update)
            .await;
        self.ports.release(port).await;
        match result {
            Ok(Some(_)) => Ok(port),
            Ok(None) => Err(HangarError::NotFound(format!("deployment {}", deployment_id))),
            Err(StoreError::DuplicateKey { .. }) => Err(HangarError::Conflict(format!(
                "port {} is already held by another deployment",
                port
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn container_spec(
        &self,
        deployment: &Deployment,
        secrets: &SecretFields,
        model: &ModelSelection,
        port: u16,
    ) -> ContainerSpec {
        let layout = self.layout.deployment(&deployment.id);
        ContainerSpec {
            name: self.container_name(&deployment.id),
            image: self.options.image.clone(),
            env: artifacts::container_env(secrets, model, self.options.service_port),
            labels: vec![
                ("hangar.managed".to_string(), "true".to_string()),
                ("hangar.deployment".to_string(), deployment.id.clone()),
                ("hangar.subdomain".to_string(), deployment.subdomain.clone()),
            ],
            binds: vec![
                BindMount {
                    host_path: layout.config_dir().path().to_path_buf(),
                    container_path: CONFIG_MOUNT.to_string(),
                    read_only: true,
                },
                BindMount {
                    host_path: layout.workspace_dir().path().to_path_buf(),
                    container_path: WORKSPACE_MOUNT.to_string(),
                    read_only: false,
                },
            ],
            port: PortMapping {
                host_port: port,
                container_port: self.options.service_port,
            },
            memory_mb: self.options.memory_mb,
            cpus: self.options.cpus,
            restart_max_retries: self.options.restart_max_retries,
        }
    }

    async fn cleanup_failed_spawn(
        &self,
        deployment_id: &str,
        progress: &SpawnProgress,
        cause: &HangarError,
    ) {
        error!(deployment_id = %deployment_id, error = %cause, "Spawn failed");

        self.health.deregister(deployment_id);
        if let Some(container_id) = &progress.container_id {
            if let Err(e) = ignore_not_found(self.runtime.remove(container_id, true).await) {
                warn!(deployment_id = %deployment_id, error = %e, "Failed to remove container after spawn failure");
            }
        }
        if let Some(port) = progress.port {
            self.ports.release(port).await;
        }

        let message = if cause.is_port_collision() {
            format!("Port collision, retrying: {}", cause)
        } else {
            cause.to_string()
        };
        if let Err(e) = self
            .fsm
            .transition_to(
                deployment_id,
                DeploymentStatus::Error,
                TransitionOptions::error(message).releasing_container(),
            )
            .await
        {
            warn!(deployment_id = %deployment_id, error = %e, "Failed to record spawn failure");
        }
    }

    /// Gracefully stop the container and mark the deployment `stopped`.
    pub async fn stop(&self, deployment_id: &str) -> Result<Deployment, HangarError> {
        let deployment = self.fsm.load(deployment_id).await?;
        self.health.deregister(deployment_id);

        if deployment.status == DeploymentStatus::Idle && deployment.container_ref.is_none() {
            return Ok(deployment);
        }

        if let Some(container_ref) = &deployment.container_ref {
            if let Err(e) = ignore_not_found(
                self.runtime
                    .stop(container_ref, self.options.stop_timeout)
                    .await,
            ) {
                self.record_failure(deployment_id, format!("Failed to stop container: {}", e))
                    .await;
                return Err(e.into());
            }
        }

        let stopped = self
            .fsm
            .transition_via_error(
                deployment_id,
                DeploymentStatus::Stopped,
                "Stopped before the agent became healthy",
                TransitionOptions::default(),
            )
            .await?;
        info!(deployment_id = %deployment_id, "Deployment stopped");
        Ok(stopped)
    }

    /// Restart the container, respawning it when it no longer exists.
    ///
    /// A deployment in a terminal status no longer holds its port, which may
    /// since have gone to another deployment, so it is respawned on a freshly
    /// reserved port instead of restarted in place.
    pub async fn restart(
        &self,
        deployment_id: &str,
        secrets: &SecretFields,
        model: &ModelSelection,
    ) -> Result<String, HangarError> {
        let deployment = self.fsm.load(deployment_id).await?;

        let (container_ref, port) = match (&deployment.container_ref, deployment.internal_port) {
            (Some(container_ref), Some(port)) => (container_ref.clone(), port),
            _ => {
                info!(deployment_id = %deployment_id, "No container to restart, spawning");
                return self.create_and_start(deployment_id, secrets, model).await;
            }
        };

        if deployment.status.is_terminal() {
            info!(
                deployment_id = %deployment_id,
                status = %deployment.status,
                released_port = port,
                "Deployment holds no port reservation, respawning"
            );
            return self.create_and_start(deployment_id, secrets, model).await;
        }

        if self.runtime.inspect(&container_ref).await?.is_none() {
            warn!(
                deployment_id = %deployment_id,
                container_id = %container_ref,
                "Recorded container is missing, respawning"
            );
            return self.create_and_start(deployment_id, secrets, model).await;
        }

        self.health.deregister(deployment_id);
        let step = TransitionOptions::step("Restarting container");
        if can_transition(deployment.status, DeploymentStatus::Restarting) {
            self.fsm
                .transition_to(deployment_id, DeploymentStatus::Restarting, step)
                .await?;
        } else if !can_transition(deployment.status, DeploymentStatus::Starting) {
            self.fsm
                .transition_via_error(
                    deployment_id,
                    DeploymentStatus::Restarting,
                    "Restart requested",
                    step,
                )
                .await?;
        }

        match self
            .runtime
            .restart(&container_ref, self.options.stop_timeout)
            .await
        {
            Ok(()) => {}
            Err(e @ RuntimeError::NotFound(_)) | Err(e @ RuntimeError::PortInUse(_)) => {
                warn!(deployment_id = %deployment_id, error = %e, "Restart failed, respawning");
                return self.create_and_start(deployment_id, secrets, model).await;
            }
            Err(e) => {
                self.record_failure(deployment_id, format!("Failed to restart container: {}", e))
                    .await;
                return Err(e.into());
            }
        }

        if let Err(e) = self
            .fsm
            .transition_to(
                deployment_id,
                DeploymentStatus::Starting,
                TransitionOptions::step("Waiting for agent"),
            )
            .await
        {
            // the container is up but the record cannot follow it
            if let Err(stop) = ignore_not_found(
                self.runtime
                    .stop(&container_ref, self.options.stop_timeout)
                    .await,
            ) {
                warn!(deployment_id = %deployment_id, error = %stop, "Failed to stop container after restart failure");
            }
            self.record_failure(deployment_id, format!("Restart could not be recorded: {}", e))
                .await;
            return Err(e);
        }
        self.health.register(deployment_id, port);
        info!(deployment_id = %deployment_id, container_id = %container_ref, "Container restarted");
        Ok(container_ref)
    }

    /// Tear down the container and on-disk data of a deployment and clear
    /// its port. The record itself is left in place.
    pub async fn remove(&self, deployment_id: &str) -> Result<(), HangarError> {
        self.health.deregister(deployment_id);

        let deployment = self.fsm.store().find_by_id(deployment_id).await?;
        let target = deployment
            .as_ref()
            .and_then(|d| d.container_ref.clone())
            .unwrap_or_else(|| self.container_name(deployment_id));
        ignore_not_found(self.runtime.remove(&target, true).await)?;

        self.layout.deployment(deployment_id).root().delete().await?;

        if let Some(deployment) = deployment {
            if let Some(port) = deployment.internal_port {
                self.ports.release(port).await;
            }
            self.fsm
                .store()
                .update_one(deployment_id, &UpdateGuard::none(), &DeploymentUpdate::release_container())
                .await?;
        }
        info!(deployment_id = %deployment_id, "Container and data removed");
        Ok(())
    }

    /// Tail of the container's log, timestamped
    pub async fn logs(&self, deployment_id: &str, tail: usize) -> Result<String, HangarError> {
        let deployment = self.fsm.load(deployment_id).await?;
        let container_ref = deployment.container_ref.ok_or_else(|| {
            HangarError::NotFound(format!("deployment {} has no container", deployment_id))
        })?;
        Ok(self.runtime.logs(&container_ref, tail, true).await?)
    }
}

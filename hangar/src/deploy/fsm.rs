//! Finite State Machine for the deployment lifecycle
//!
//! Every status write goes through [`StateMachine::transition_to`], which
//! checks the edge against the transition table and persists it with a
//! conditional update on the status it read. Two concurrent callers can
//! therefore never both move the same record from the same status.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::errors::HangarError;
use crate::models::deployment::{Deployment, DeploymentStatus};
use crate::store::{DeploymentStore, DeploymentUpdate, UpdateGuard};

/// Statuses reachable from `from`, excluding the implicit self-transition
pub fn allowed_next(from: DeploymentStatus) -> &'static [DeploymentStatus] {
    use DeploymentStatus::*;

    match from {
        Idle => &[Configuring, Provisioning, Error],
        Configuring => &[Provisioning, Error],
        Provisioning => &[Starting, Error],
        Starting => &[Healthy, Error],
        Healthy => &[Stopped, Restarting, Error],
        Stopped => &[Configuring, Idle, Starting, Error],
        Restarting => &[Starting, Healthy, Error],
        Error => &[Configuring, Idle, Restarting, Stopped],
    }
}

/// Whether `from -> to` is a legal edge. Self-transitions are always legal.
pub fn can_transition(from: DeploymentStatus, to: DeploymentStatus) -> bool {
    from == to || allowed_next(from).contains(&to)
}

/// Extra fields written together with a transition
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    /// Message recorded when entering `error`
    pub error_message: Option<String>,

    /// Progress label; cleared automatically on stable statuses
    pub provisioning_step: Option<String>,

    /// Clear `container_ref` and `internal_port` in the same write
    pub release_container: bool,

    /// Only apply if the record still points at this container
    pub expected_container_ref: Option<String>,
}

impl TransitionOptions {
    pub fn step(step: impl Into<String>) -> Self {
        Self {
            provisioning_step: Some(step.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn releasing_container(mut self) -> Self {
        self.release_container = true;
        self
    }
}

/// Persists lifecycle transitions
pub struct StateMachine {
    store: Arc<dyn DeploymentStore>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn DeploymentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    /// Load a deployment or fail with `NotFound`
    pub async fn load(&self, deployment_id: &str) -> Result<Deployment, HangarError> {
        self.store
            .find_by_id(deployment_id)
            .await?
            .ok_or_else(|| HangarError::NotFound(format!("deployment {}", deployment_id)))
    }

    /// Move a deployment to `target`.
    ///
    /// Illegal edges fail with `InvalidTransition` and leave the record
    /// untouched. A record whose status changed between read and write fails
    /// with `Conflict`.
    pub async fn transition_to(
        &self,
        deployment_id: &str,
        target: DeploymentStatus,
        options: TransitionOptions,
    ) -> Result<Deployment, HangarError> {
        let current = self.load(deployment_id).await?;
        if !can_transition(current.status, target) {
            return Err(HangarError::InvalidTransition {
                from: current.status,
                to: target,
            });
        }

        let mut update = DeploymentUpdate {
            status: Some(target),
            ..Default::default()
        };

        if target == DeploymentStatus::Error {
            let message = options
                .error_message
                .unwrap_or_else(|| "Unknown error".to_string());
            update.error_message = Some(Some(message));
        } else {
            update.error_message = Some(None);
        }

        if target.is_stable() {
            update.provisioning_step = Some(None);
        } else if let Some(step) = options.provisioning_step {
            update.provisioning_step = Some(Some(step));
        }

        if target == DeploymentStatus::Healthy {
            update.last_heartbeat = Some(Utc::now());
        }

        if options.release_container {
            update.container_ref = Some(None);
            update.internal_port = Some(None);
        }

        let mut guard = UpdateGuard::status(current.status);
        if let Some(expected) = options.expected_container_ref {
            guard = guard.with_container_ref(expected);
        }

        match self.store.update_one(deployment_id, &guard, &update).await? {
            Some(updated) => {
                if current.status != target {
                    info!(
                        deployment_id = %deployment_id,
                        from = %current.status,
                        to = %target,
                        "Deployment transitioned"
                    );
                }
                Ok(updated)
            }
            None => match self.store.find_by_id(deployment_id).await? {
                None => Err(HangarError::NotFound(format!("deployment {}", deployment_id))),
                Some(now) => Err(HangarError::Conflict(format!(
                    "deployment {} changed concurrently ({} -> {})",
                    deployment_id, current.status, now.status
                ))),
            },
        }
    }

    /// Move to `target`, detouring through `error` when there is no direct
    /// edge but `current -> error -> target` is legal.
    ///
    /// Used when an operation must recover a deployment from a status that
    /// has no edge to where the operation starts (for example a stop issued
    /// while still `starting`).
    pub async fn transition_via_error(
        &self,
        deployment_id: &str,
        target: DeploymentStatus,
        reason: &str,
        options: TransitionOptions,
    ) -> Result<Deployment, HangarError> {
        let current = self.load(deployment_id).await?;
        if !can_transition(current.status, target)
            && can_transition(current.status, DeploymentStatus::Error)
            && can_transition(DeploymentStatus::Error, target)
        {
            debug!(
                deployment_id = %deployment_id,
                from = %current.status,
                to = %target,
                "No direct edge, detouring through error"
            );
            self.transition_to(
                deployment_id,
                DeploymentStatus::Error,
                TransitionOptions::error(reason),
            )
            .await?;
        }
        self.transition_to(deployment_id, target, options).await
    }

    /// Update the progress label without changing status
    pub async fn set_step(&self, deployment_id: &str, step: &str) -> Result<(), HangarError> {
        let update = DeploymentUpdate {
            provisioning_step: Some(Some(step.to_string())),
            ..Default::default()
        };
        self.store
            .update_one(deployment_id, &UpdateGuard::none(), &update)
            .await?;
        Ok(())
    }
}

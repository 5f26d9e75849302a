//! Deployment record store
//!
//! The store is the source of desired state. Implementations must enforce two
//! uniqueness constraints: `subdomain` across all records, and
//! `internal_port` across records whose status is not terminal.

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::deployment::{Deployment, DeploymentStatus, SecretFields};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write
    #[error("duplicate value for unique field {field}: {value}")]
    DuplicateKey { field: &'static str, value: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Conditions a record must meet for a conditional update to apply
#[derive(Debug, Clone, Default)]
pub struct UpdateGuard {
    /// Allowed current statuses; `None` allows any
    pub status_in: Option<Vec<DeploymentStatus>>,

    /// Required current container reference
    pub container_ref: Option<String>,
}

impl UpdateGuard {
    /// Unconditional update
    pub fn none() -> Self {
        Self::default()
    }

    pub fn status(status: DeploymentStatus) -> Self {
        Self {
            status_in: Some(vec![status]),
            container_ref: None,
        }
    }

    pub fn status_in(statuses: &[DeploymentStatus]) -> Self {
        Self {
            status_in: Some(statuses.to_vec()),
            container_ref: None,
        }
    }

    pub fn with_container_ref(mut self, container_ref: impl Into<String>) -> Self {
        self.container_ref = Some(container_ref.into());
        self
    }

    pub fn matches(&self, deployment: &Deployment) -> bool {
        if let Some(statuses) = &self.status_in {
            if !statuses.contains(&deployment.status) {
                return false;
            }
        }
        if let Some(expected) = &self.container_ref {
            if deployment.container_ref.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Partial update of a deployment record.
///
/// `None` leaves a field untouched; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct DeploymentUpdate {
    pub status: Option<DeploymentStatus>,
    pub container_ref: Option<Option<String>>,
    pub internal_port: Option<Option<u16>>,
    pub secrets: Option<SecretFields>,
    pub provisioning_step: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl DeploymentUpdate {
    /// Clear both the container reference and the port, which are always
    /// set and cleared together.
    pub fn release_container() -> Self {
        Self {
            container_ref: Some(None),
            internal_port: Some(None),
            ..Default::default()
        }
    }

    /// Apply this update to a record in place.
    pub fn apply(&self, deployment: &mut Deployment) {
        if let Some(status) = self.status {
            deployment.status = status;
        }
        if let Some(container_ref) = &self.container_ref {
            deployment.container_ref = container_ref.clone();
        }
        if let Some(internal_port) = self.internal_port {
            deployment.internal_port = internal_port;
        }
        if let Some(secrets) = &self.secrets {
            deployment.secrets = secrets.clone();
        }
        if let Some(step) = &self.provisioning_step {
            deployment.provisioning_step = step.clone();
        }
        if let Some(message) = &self.error_message {
            deployment.error_message = message.clone();
        }
        if let Some(heartbeat) = self.last_heartbeat {
            deployment.last_heartbeat = Some(heartbeat);
        }
        deployment.updated_at = Utc::now();
    }
}

/// Filter for `find_many`
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub status_in: Option<Vec<DeploymentStatus>>,
    pub exclude_status: Option<Vec<DeploymentStatus>>,
    pub has_container_ref: Option<bool>,
    pub has_internal_port: Option<bool>,
}

impl DeploymentFilter {
    /// Records that still hold a port reservation
    pub fn active_ports() -> Self {
        Self {
            exclude_status: Some(vec![
                DeploymentStatus::Idle,
                DeploymentStatus::Stopped,
                DeploymentStatus::Error,
            ]),
            has_internal_port: Some(true),
            ..Default::default()
        }
    }

    pub fn matches(&self, deployment: &Deployment) -> bool {
        if let Some(statuses) = &self.status_in {
            if !statuses.contains(&deployment.status) {
                return false;
            }
        }
        if let Some(excluded) = &self.exclude_status {
            if excluded.contains(&deployment.status) {
                return false;
            }
        }
        if let Some(expected) = self.has_container_ref {
            if deployment.container_ref.is_some() != expected {
                return false;
            }
        }
        if let Some(expected) = self.has_internal_port {
            if deployment.internal_port.is_some() != expected {
                return false;
            }
        }
        true
    }
}

/// Durable, strongly consistent deployment store
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Deployment>, StoreError>;

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Deployment>, StoreError>;

    async fn find_many(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>, StoreError>;

    /// Insert a new record; fails with `DuplicateKey` on a taken subdomain.
    async fn insert(&self, deployment: Deployment) -> Result<(), StoreError>;

    /// Apply `update` if the record exists and `guard` matches.
    ///
    /// Returns the updated record, or `None` when the record is missing or the
    /// guard did not match. Uniqueness violations are errors.
    async fn update_one(
        &self,
        id: &str,
        guard: &UpdateGuard,
        update: &DeploymentUpdate,
    ) -> Result<Option<Deployment>, StoreError>;

    /// Delete a record; returns whether it existed.
    async fn delete_one(&self, id: &str) -> Result<bool, StoreError>;
}

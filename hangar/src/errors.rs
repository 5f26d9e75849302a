//! Error types for the Hangar control plane

use thiserror::Error;

use crate::deploy::runtime::RuntimeError;
use crate::models::deployment::DeploymentStatus;
use crate::secrets::codec::SecretsError;
use crate::store::StoreError;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum HangarError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Secrets error: {0}")]
    SecretsError(#[from] SecretsError),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Container runtime error: {0}")]
    RuntimeError(#[from] RuntimeError),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("No free port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl HangarError {
    /// Whether the failure came from the runtime refusing the published host port.
    pub fn is_port_collision(&self) -> bool {
        matches!(self, HangarError::RuntimeError(RuntimeError::PortInUse(_)))
    }
}

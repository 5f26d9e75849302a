//! Control plane API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Deployment status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatusResponse {
    pub id: String,
    pub subdomain: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Container log tail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentLogsResponse {
    pub id: String,
    pub tail: usize,
    pub lines: Vec<String>,
}

/// Error body returned by the main application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    /// Deployment status behind a routing error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

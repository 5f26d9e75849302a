//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use openapi_server::models::{
    DeploymentLogsResponse, DeploymentStatusResponse, ErrorResponse, HealthResponse,
    VersionResponse,
};
use serde::Deserialize;
use tracing::error;

use crate::errors::HangarError;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Default number of log lines
const DEFAULT_TAIL: usize = 100;

/// Largest accepted `tail`
const MAX_TAIL: usize = 5_000;

impl IntoResponse for HangarError {
    fn into_response(self) -> Response {
        let (code, error) = match &self {
            HangarError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            HangarError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            HangarError::Conflict(_) | HangarError::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, "conflict")
            }
            HangarError::PortsExhausted { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "ports_exhausted")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        if code == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
        }
        (
            code,
            Json(ErrorResponse {
                error: error.to_string(),
                message: self.to_string(),
                status: None,
            }),
        )
            .into_response()
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "hangar".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Deployment status handler
pub async fn deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentStatusResponse>, HangarError> {
    let deployment = state.orchestrator.get(&id).await?;
    Ok(Json(DeploymentStatusResponse {
        id: deployment.id,
        subdomain: deployment.subdomain,
        status: deployment.status.to_string(),
        provisioning_step: deployment.provisioning_step,
        error_message: deployment.error_message,
        last_heartbeat: deployment.last_heartbeat,
        updated_at: deployment.updated_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

/// Deployment logs handler
pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<DeploymentLogsResponse>, HangarError> {
    let tail = query.tail.unwrap_or(DEFAULT_TAIL).clamp(1, MAX_TAIL);
    let output = state.orchestrator.logs(&id, tail).await?;
    Ok(Json(DeploymentLogsResponse {
        id,
        tail,
        lines: output.lines().map(str::to_string).collect(),
    }))
}

/// Fallback for unknown paths on the main application
pub async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "not_found".to_string(),
            message: "No such route".to_string(),
            status: None,
        }),
    )
}

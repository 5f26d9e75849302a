//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::HangarError;
use crate::proxy::router::{route_request, ProxyState};
use crate::server::handlers::{
    deployment_handler, health_handler, logs_handler, not_found_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the listener's router.
///
/// The subdomain router wraps every route and the fallback, so tenant
/// traffic (HTTP and websocket upgrades) is diverted before the main
/// application sees it.
pub fn router(state: Arc<ServerState>, proxy: Arc<ProxyState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Deployments
        .route("/deployments/{id}", get(deployment_handler))
        .route("/deployments/{id}/logs", get(logs_handler))
        .fallback(not_found_handler)
        // State and middleware
        .with_state(state)
        .layer(middleware::from_fn_with_state(proxy, route_request))
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    proxy: Arc<ProxyState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), HangarError>>, HangarError> {
    let app = router(state, proxy);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| HangarError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| HangarError::ServerError(e.to_string()))
    });

    Ok(handle)
}

//! Subdomain router and reverse proxy.
//!
//! Runs as middleware in front of every route of the main listener. Requests
//! whose host names a tenant are resolved to that tenant's backend and
//! forwarded; everything else continues to the main application.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::StatusCode;
use openapi_server::models::ErrorResponse;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as BackendCloseFrame;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use crate::cache::route::{RouteCache, RouteEntry};
use crate::errors::HangarError;
use crate::models::deployment::DeploymentStatus;
use crate::proxy::host::extract_subdomain;
use crate::store::DeploymentStore;

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Proxy options
#[derive(Debug, Clone)]
pub struct Options {
    /// Host the tenant containers publish their ports on
    pub backend_host: String,

    /// TCP connect timeout towards a backend
    pub connect_timeout: Duration,

    /// Seconds suggested in `Retry-After` for transient states
    pub retry_after_secs: u64,

    /// Largest request body forwarded to a backend
    pub max_body_bytes: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            backend_host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(5),
            retry_after_secs: 5,
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// No tenant in the host, serve from the main application
    PassThrough,

    /// Tenant label with no deployment behind it
    NotFound { subdomain: String },

    /// Deployment exists but is not serving
    Unavailable {
        subdomain: String,
        status: DeploymentStatus,
        error_message: Option<String>,
    },

    /// Forward to the local backend port
    Proxy { subdomain: String, port: u16 },
}

pub struct ProxyState {
    store: Arc<dyn DeploymentStore>,
    routes: Arc<RouteCache>,
    client: reqwest::Client,
    options: Options,
}

impl ProxyState {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        routes: Arc<RouteCache>,
        options: Options,
    ) -> Result<Self, HangarError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(options.connect_timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            store,
            routes,
            client,
            options,
        })
    }

    pub fn routes(&self) -> &Arc<RouteCache> {
        &self.routes
    }

    /// Look up the route of a subdomain, through the cache
    pub async fn lookup(&self, subdomain: &str) -> Result<Option<RouteEntry>, HangarError> {
        if let Some(entry) = self.routes.get(subdomain) {
            return Ok(Some(entry));
        }
        let epoch = self.routes.epoch();
        match self.store.find_by_subdomain(subdomain).await? {
            Some(deployment) => {
                let entry = RouteEntry::from(&deployment);
                if !self.routes.insert_at(subdomain, entry.clone(), epoch) {
                    debug!(subdomain = %subdomain, "Route invalidated during lookup, not caching");
                }
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Decide where a request for `host` goes
    pub async fn resolve(&self, host: Option<&str>) -> Result<RouteDecision, HangarError> {
        let subdomain = match host.and_then(extract_subdomain) {
            Some(subdomain) => subdomain,
            None => return Ok(RouteDecision::PassThrough),
        };

        let entry = match self.lookup(&subdomain).await? {
            Some(entry) => entry,
            None => return Ok(RouteDecision::NotFound { subdomain }),
        };

        match (entry.status, entry.port) {
            (DeploymentStatus::Healthy, Some(port)) => Ok(RouteDecision::Proxy { subdomain, port }),
            (status, _) => Ok(RouteDecision::Unavailable {
                subdomain,
                status,
                error_message: entry.error_message,
            }),
        }
    }
}

/// User-readable explanation of why a deployment is not serving
pub fn unavailable_message(
    subdomain: &str,
    status: DeploymentStatus,
    error_message: Option<&str>,
) -> String {
    use DeploymentStatus::*;

    match status {
        Idle | Stopped => format!(
            "Agent '{}' is {}. Start it from your dashboard to bring it online.",
            subdomain, status
        ),
        Configuring | Provisioning | Starting | Restarting => format!(
            "Agent '{}' is {}. It will be available shortly, please retry in a few seconds.",
            subdomain, status
        ),
        Error => format!(
            "Agent '{}' failed: {}",
            subdomain,
            error_message.unwrap_or("Unknown error")
        ),
        Healthy => format!(
            "Agent '{}' has no backend assigned yet, please retry in a few seconds.",
            subdomain
        ),
    }
}

fn error_response(code: StatusCode, error: &str, message: String, status: Option<String>) -> Response {
    (
        code,
        Json(ErrorResponse {
            error: error.to_string(),
            message,
            status,
        }),
    )
        .into_response()
}

fn request_host(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Hop-by-hop headers are connection-scoped and never forwarded
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
}

/// Middleware entry point
pub async fn route_request(
    State(state): State<Arc<ProxyState>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let host = request_host(&parts);

    let decision = match state.resolve(host.as_deref()).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(host = ?host, error = %e, "Route lookup failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "route_lookup_failed",
                "Could not resolve this agent right now, please retry.".to_string(),
                None,
            );
        }
    };

    match decision {
        RouteDecision::PassThrough => next.run(Request::from_parts(parts, body)).await,
        RouteDecision::NotFound { subdomain } => error_response(
            StatusCode::NOT_FOUND,
            "deployment_not_found",
            format!("No agent is deployed at '{}'", subdomain),
            None,
        ),
        RouteDecision::Unavailable {
            subdomain,
            status,
            error_message,
        } => {
            let mut response = error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "deployment_unavailable",
                unavailable_message(&subdomain, status, error_message.as_deref()),
                Some(status.to_string()),
            );
            if !status.is_stable() {
                if let Ok(value) = HeaderValue::from_str(&state.options.retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            response
        }
        RouteDecision::Proxy { subdomain, port } => {
            if is_websocket_upgrade(&parts.headers) {
                proxy_websocket(&state, &subdomain, port, &mut parts).await
            } else {
                proxy_http(&state, &subdomain, port, host, parts, body).await
            }
        }
    }
}

fn bad_gateway(subdomain: &str) -> Response {
    error_response(
        StatusCode::BAD_GATEWAY,
        "backend_unreachable",
        format!(
            "Agent '{}' is not responding. It may be restarting, please retry in a few seconds.",
            subdomain
        ),
        None,
    )
}

async fn proxy_http(
    state: &ProxyState,
    subdomain: &str,
    port: u16,
    host: Option<String>,
    parts: Parts,
    body: Body,
) -> Response {
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("http://{}:{}{}", state.options.backend_host, port, path);

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    if let Some(value) = host.and_then(|h| HeaderValue::from_str(&h).ok()) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }

    let body = match axum::body::to_bytes(body, state.options.max_body_bytes).await {
        Ok(body) => body,
        Err(_) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "Request body is too large".to_string(),
                None,
            )
        }
    };

    let upstream = state
        .client
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(subdomain = %subdomain, port, error = %e, "Backend request failed");
            return bad_gateway(subdomain);
        }
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn connect_backend(
    state: &ProxyState,
    port: u16,
    parts: &Parts,
) -> Result<(BackendSocket, Option<String>), HangarError> {
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("ws://{}:{}{}", state.options.backend_host, port, path);

    let mut request = url
        .into_client_request()
        .map_err(|e| HangarError::ServerError(e.to_string()))?;
    for name in [
        header::AUTHORIZATION,
        header::COOKIE,
        header::ORIGIN,
        header::SEC_WEBSOCKET_PROTOCOL,
    ] {
        if let Some(value) = parts.headers.get(&name) {
            request.headers_mut().insert(name, value.clone());
        }
    }

    let connect = tokio_tungstenite::connect_async(request);
    let (socket, response) = tokio::time::timeout(state.options.connect_timeout, connect)
        .await
        .map_err(|_| HangarError::ServerError("backend websocket connect timed out".to_string()))?
        .map_err(|e| HangarError::ServerError(e.to_string()))?;

    let protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Ok((socket, protocol))
}

async fn proxy_websocket(
    state: &ProxyState,
    subdomain: &str,
    port: u16,
    parts: &mut Parts,
) -> Response {
    let upgrade = match WebSocketUpgrade::from_request_parts(parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    // The backend handshake happens first so a dead backend is reported
    // before the client connection is upgraded.
    let (backend, protocol) = match connect_backend(state, port, parts).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(subdomain = %subdomain, port, error = %e, "Backend websocket handshake failed");
            let mut response = bad_gateway(subdomain);
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            return response;
        }
    };

    let upgrade = match protocol {
        Some(protocol) => upgrade.protocols([protocol]),
        None => upgrade,
    };
    let subdomain = subdomain.to_string();
    upgrade.on_upgrade(move |client| relay(client, backend, subdomain))
}

fn to_backend(message: Message) -> BackendMessage {
    match message {
        Message::Text(text) => BackendMessage::Text(text.as_str().to_owned().into()),
        Message::Binary(data) => BackendMessage::Binary(data),
        Message::Ping(data) => BackendMessage::Ping(data),
        Message::Pong(data) => BackendMessage::Pong(data),
        Message::Close(frame) => BackendMessage::Close(frame.map(|f| BackendCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().to_owned().into(),
        })),
    }
}

fn to_client(message: BackendMessage) -> Option<Message> {
    match message {
        BackendMessage::Text(text) => Some(Message::Text(text.as_str().to_owned().into())),
        BackendMessage::Binary(data) => Some(Message::Binary(data)),
        BackendMessage::Ping(data) => Some(Message::Ping(data)),
        BackendMessage::Pong(data) => Some(Message::Pong(data)),
        BackendMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason.as_str().to_owned().into(),
        }))),
        BackendMessage::Frame(_) => None,
    }
}

/// Pump frames both ways until either side closes. Both sockets are
/// dropped on return, so neither is left half-open.
async fn relay(client: WebSocket, backend: BackendSocket, subdomain: String) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let closing = matches!(message, Message::Close(_));
            if backend_tx.send(to_backend(message)).await.is_err() || closing {
                break;
            }
        }
        let _ = backend_tx.close().await;
    };

    let downstream = async {
        while let Some(Ok(message)) = backend_rx.next().await {
            let Some(message) = to_client(message) else {
                continue;
            };
            let closing = matches!(message, Message::Close(_));
            if client_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }
    debug!(subdomain = %subdomain, "Websocket relay closed");
}

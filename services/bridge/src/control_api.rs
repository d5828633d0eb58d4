//! Localhost control API for the bridge.
//!
//! Binds to 127.0.0.1:9191 by default (or a caller-supplied address).
//! Routes:
//!   GET  /healthz             - liveness check
//!   GET  /api/v1/status       - connection status
//!   GET  /api/v1/stats        - statistics snapshot
//!   GET  /api/v1/logs         - recent status lines
//!   POST /api/v1/connect      - request a connection (async, 202)
//!   POST /api/v1/disconnect   - drop the connection (async, 202)
//!   POST /api/v1/fetch-latest - re-request the latest record (async, 202)
//!   PUT  /api/v1/enabled      - enable or disable the bridge (204)

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::service::BridgeHandle;
use crate::status_log::StatusEntry;

// ---------------------------------------------------------------------------
// Request/Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub connection_state: String,
    pub reason: Option<String>,
    pub connected: bool,
    pub retry_count: u32,
    pub retry_pending: bool,
    pub retries_exhausted: bool,
    pub status_text: String,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub entries: Vec<StatusEntry>,
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlApiError {
    #[error("binding control API to {bind}: {source}")]
    Bind {
        bind: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(bridge): State<BridgeHandle>) -> Json<StatusResponse> {
    let link = bridge.link_status();
    Json(StatusResponse {
        connection_state: link.state.label().to_owned(),
        reason: link.state.reason().map(str::to_owned),
        connected: bridge.is_connected(),
        retry_count: link.retry_count,
        retry_pending: link.retry_pending,
        retries_exhausted: link.retries_exhausted,
        status_text: bridge.status_text(),
    })
}

async fn get_stats(State(bridge): State<BridgeHandle>) -> impl IntoResponse {
    Json(bridge.statistics())
}

async fn get_logs(State(bridge): State<BridgeHandle>) -> Json<LogsResponse> {
    Json(LogsResponse {
        entries: bridge.log_entries(),
    })
}

async fn post_connect(State(bridge): State<BridgeHandle>) -> StatusCode {
    match bridge.connect().await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn post_disconnect(State(bridge): State<BridgeHandle>) -> StatusCode {
    match bridge.disconnect().await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn post_fetch_latest(State(bridge): State<BridgeHandle>) -> StatusCode {
    match bridge.fetch_latest().await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn put_enabled(
    State(bridge): State<BridgeHandle>,
    Json(body): Json<EnabledRequest>,
) -> StatusCode {
    match bridge.set_enabled(body.enabled).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

// ---------------------------------------------------------------------------
// Router / server
// ---------------------------------------------------------------------------

pub fn build_router(bridge: BridgeHandle) -> Router {
    Router::new()
        .route("/healthz",             get(healthz))
        .route("/api/v1/status",       get(get_status))
        .route("/api/v1/stats",        get(get_stats))
        .route("/api/v1/logs",         get(get_logs))
        .route("/api/v1/connect",      post(post_connect))
        .route("/api/v1/disconnect",   post(post_disconnect))
        .route("/api/v1/fetch-latest", post(post_fetch_latest))
        .route("/api/v1/enabled",      put(put_enabled))
        .with_state(bridge)
}

/// Bind `bind` and serve the control API in the background.
pub async fn serve(
    bind: &str,
    bridge: BridgeHandle,
) -> Result<(SocketAddr, JoinHandle<()>), ControlApiError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| ControlApiError::Bind {
            bind: bind.to_owned(),
            source: e,
        })?;
    let addr = listener.local_addr().map_err(|e| ControlApiError::Bind {
        bind: bind.to_owned(),
        source: e,
    })?;
    info!(addr = %addr, "control API listening");
    let app = build_router(bridge);
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "control API server failed");
        }
    });
    Ok((addr, task))
}

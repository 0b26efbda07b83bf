// ABOUTME: Operator-facing HTTP server: control WebSocket, status snapshot and Prometheus metrics
// ABOUTME: Translates HTTP and WebSocket traffic into ControlHandle requests

pub mod websocket;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chirp_core::config::ControlConfig;
use chirp_core::{ControlHandle, ControlVerb};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Header carrying the control token; WebSocket clients may use `?token=` instead
pub const TOKEN_HEADER: &str = "X-API-Key";

#[derive(Clone)]
pub struct ControlState {
    pub handle: ControlHandle,
    pub token: Option<String>,
    pub metrics: Option<PrometheusHandle>,
}

impl ControlState {
    pub fn new(handle: ControlHandle) -> Self {
        Self {
            handle,
            token: None,
            metrics: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<PrometheusHandle>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Constant-time comparison for tokens
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn query_token(request: &Request) -> Option<String> {
    url::form_urlencoded::parse(request.uri().query()?.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

/// Rejects requests without the configured token
pub async fn auth_middleware(
    State(state): State<ControlState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query_token(&request));

    let denied = match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => None,
        Some(_) => Some("invalid token"),
        None => Some("missing token"),
    };

    match denied {
        None => Ok(next.run(request).await),
        Some(reason) => {
            tracing::warn!(path = %request.uri().path(), reason, "Control access denied");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn status_handler(State(state): State<ControlState>) -> Response {
    match state.handle.request(ControlVerb::GetStatus).await {
        Ok(ack) => match ack.status {
            Some(status) => Json(status).into_response(),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "status missing from acknowledgment").into_response(),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Status request failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn metrics_handler(State(state): State<ControlState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/control/ws", get(websocket::ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn serve(config: &ControlConfig, state: ControlState, cancel: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind control server on {}", addr))?;
    tracing::info!(addr = %addr, auth = state.token.is_some(), "Starting control server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Control server failed")?;
    tracing::info!("Control server stopped");
    Ok(())
}

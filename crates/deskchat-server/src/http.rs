//! HTTP surface of the bridge.
//!
//! Thin by intent: every route parses a request, hands it to the runtime,
//! and wraps the outcome in the uniform response envelope. No bridging logic
//! lives here.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use deskchat_types::{BridgeResponse, ErrorKind, Op};

use crate::AppState;

#[derive(Debug, Deserialize)]
struct InvokeInput {
    op: Op,
    #[serde(default)]
    params: Value,
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/initialize", post(initialize))
        .route("/status", get(status))
        .route("/invoke", post(invoke))
        .route("/drain", post(drain))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state)
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let Some(expected) = state.api_token.as_deref() else {
        return next.run(request).await;
    };

    let provided = extract_request_token(request.headers());
    if provided.as_deref() == Some(expected) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(BridgeResponse::err(
            ErrorKind::InvalidRequest,
            "missing or invalid api token",
        )),
    )
        .into_response()
}

fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("x-deskchat-token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn initialize(State(state): State<AppState>) -> Response {
    match state.runtime.initialize().await {
        Ok(data) => envelope(BridgeResponse::ok(data)),
        Err(e) => envelope(BridgeResponse::err(e.kind(), e.to_string())),
    }
}

async fn status(State(state): State<AppState>) -> Response {
    let report = state.runtime.status().await;
    let data = serde_json::to_value(&report).unwrap_or(Value::Null);
    envelope(BridgeResponse::ok(data))
}

async fn invoke(State(state): State<AppState>, Json(input): Json<InvokeInput>) -> Response {
    envelope(state.runtime.handle(input.op, input.params).await)
}

/// Body is optional; an empty POST drains the first non-empty backlog.
async fn drain(State(state): State<AppState>, body: Bytes) -> Response {
    let params = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                return envelope(BridgeResponse::err(
                    ErrorKind::InvalidRequest,
                    format!("malformed drain body: {e}"),
                ));
            }
        }
    };
    envelope(state.runtime.handle(Op::Drain, params).await)
}

fn envelope(response: BridgeResponse) -> Response {
    let status = match response.error_kind {
        None => StatusCode::OK,
        Some(ErrorKind::InvalidRequest) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::UnsupportedOperation) => StatusCode::NOT_IMPLEMENTED,
        Some(ErrorKind::NotInitialized) => StatusCode::CONFLICT,
        Some(ErrorKind::TargetUnresolved) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ErrorKind::ArtifactNotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        Some(ErrorKind::BackendUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        Some(ErrorKind::StaleHandle)
        | Some(ErrorKind::RecoveryExhausted)
        | Some(ErrorKind::Backend) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(response)).into_response()
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let monitor = state.runtime.spawn_monitor();
    let runtime = state.runtime.clone();
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "bridge listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    monitor.abort();
    runtime.shutdown().await;
    result?;
    Ok(())
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::{Json, Router};
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::parse_duration_str;
use crate::error::{Result, WardenError};
use crate::model::Protocol;
use crate::resolver::blocking::BlockingResolver;
use crate::server::ServerContext;

const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// State shared by the control API and the DoH endpoint.
#[derive(Clone)]
pub struct HttpState {
    pub context: ServerContext,
    pub blocking: Arc<BlockingResolver>,
}

/// HTTP server: blocking control, list refresh, metrics export and DoH.
pub async fn run_http_server(
    bind_addr: SocketAddr,
    state: HttpState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let app = Router::new()
        .route("/api/blocking/enable", get(blocking_enable))
        .route("/api/blocking/disable", get(blocking_disable))
        .route("/api/blocking/status", get(blocking_status))
        .route("/api/lists/refresh", post(lists_refresh))
        .route("/metrics", get(metrics))
        .route("/dns-query", get(doh_get).post(doh_post))
        .with_state(state)
        .layer(CorsLayer::permissive());

    info!("HTTP server listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    })
    .await
    .map_err(|e| WardenError::Startup(format!("http server: {}", e)))
}

fn api_error(status: StatusCode, message: impl Into<String>) -> AxumResponse {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn blocking_enable(State(state): State<HttpState>) -> AxumResponse {
    state.blocking.enable();
    Json(json!({ "enabled": true })).into_response()
}

async fn blocking_disable(
    State(state): State<HttpState>,
    Query(params): Query<HashMap<String, String>>,
) -> AxumResponse {
    let duration = match params.get("duration") {
        Some(raw) => match parse_duration_str(raw) {
            Ok(duration) => Some(duration),
            Err(e) => return api_error(StatusCode::BAD_REQUEST, e),
        },
        None => None,
    };
    let groups: Vec<String> = params
        .get("groups")
        .map(|g| g.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    state.blocking.clone().disable(duration, groups);
    Json(json!({ "enabled": false })).into_response()
}

async fn blocking_status(State(state): State<HttpState>) -> AxumResponse {
    Json(state.blocking.status()).into_response()
}

async fn lists_refresh(State(state): State<HttpState>) -> AxumResponse {
    match state.blocking.refresh_lists().await {
        Ok(()) => Json(json!({ "refreshed": true })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn metrics(State(state): State<HttpState>) -> AxumResponse {
    match state.context.metrics.export() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// DoH GET: the query travels base64url-encoded in the `dns` parameter.
async fn doh_get(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> AxumResponse {
    let Some(encoded) = params.get("dns") else {
        return api_error(StatusCode::BAD_REQUEST, "missing dns parameter");
    };
    let wire = match URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')) {
        Ok(wire) => wire,
        Err(_) => return api_error(StatusCode::BAD_REQUEST, "invalid base64url in dns parameter"),
    };
    doh_answer(&state, &wire, peer).await
}

/// DoH POST: raw `application/dns-message` body.
async fn doh_post(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> AxumResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != DNS_MESSAGE_CONTENT_TYPE {
        return api_error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "expected application/dns-message");
    }
    doh_answer(&state, &body, peer).await
}

async fn doh_answer(state: &HttpState, wire: &[u8], peer: SocketAddr) -> AxumResponse {
    match state.context.handle_message(wire, peer.ip(), Protocol::Https).await {
        Some(response) => (
            [(header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)],
            response,
        )
            .into_response(),
        None => api_error(StatusCode::BAD_REQUEST, "unanswerable DNS message"),
    }
}

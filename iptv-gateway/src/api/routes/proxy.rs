//! Stream proxy routes.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Uri, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;

use crate::api::auth::{request_token, require_viewer};
use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::proxy::DEFAULT_CONTENT_TYPE;
use crate::session::SessionInfo;

/// Create the proxy router. Mounted under `/api/proxy`.
pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/status", get(proxy_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_viewer))
        // Media players cannot always send headers, so the stream checks its own token.
        .route("/stream/{channel_id}", get(stream_channel))
}

#[derive(Debug, Serialize)]
pub struct ProxyStatusResponse {
    pub active_connections: usize,
    pub sessions: Vec<SessionInfo>,
}

async fn stream_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<Response> {
    let token = request_token(&headers, &uri);
    let stream = state.gateway.stream(token.as_deref(), channel_id).await?;

    let content_type = HeaderValue::from_str(&stream.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

    let mut response = Body::from_stream(stream.body).into_response();
    let out = response.headers_mut();
    out.insert(header::CONTENT_TYPE, content_type);
    out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

async fn proxy_status(State(state): State<AppState>) -> Json<ProxyStatusResponse> {
    let sessions = state.gateway.registry().list(state.clock.now());
    Json(ProxyStatusResponse {
        active_connections: sessions.len(),
        sessions,
    })
}

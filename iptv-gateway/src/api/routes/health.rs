//! Channel health routes and process liveness.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;

use crate::api::auth::require_viewer;
use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::health::ProbeSummary;

/// Create the channel health router. Mounted under `/api/health`.
pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/check/{channel_id}", post(check_channel))
        .route("/check-all", post(check_all))
        .route("/status", get(health_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_viewer))
}

/// Create the liveness router. Mounted under `/health`.
pub fn liveness_router() -> Router<AppState> {
    Router::new().route("/live", get(liveness_check))
}

#[derive(Debug, Serialize)]
pub struct ChannelCheckResponse {
    pub channel_id: i64,
    pub channel_name: String,
    pub is_healthy: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub last_check: String,
}

#[derive(Debug, Serialize)]
pub struct UnhealthyChannel {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub last_check: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatusResponse {
    pub total: i64,
    pub healthy: i64,
    pub unhealthy: i64,
    pub unhealthy_channels: Vec<UnhealthyChannel>,
}

async fn check_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
) -> ApiResult<Json<ChannelCheckResponse>> {
    let report = state.engine.probe_by_id(channel_id).await?;
    Ok(Json(ChannelCheckResponse {
        channel_id: report.channel_id,
        channel_name: report.channel_name,
        is_healthy: report.healthy,
        attempts: report.attempts,
        cause: report.cause,
        last_check: report.checked_at.to_rfc3339(),
    }))
}

async fn check_all(State(state): State<AppState>) -> ApiResult<Json<ProbeSummary>> {
    Ok(Json(state.engine.probe_all().await?))
}

async fn health_status(State(state): State<AppState>) -> ApiResult<Json<HealthStatusResponse>> {
    let summary = state.channels.health_summary().await?;
    Ok(Json(HealthStatusResponse {
        total: summary.total,
        healthy: summary.healthy,
        unhealthy: summary.unhealthy,
        unhealthy_channels: summary
            .unhealthy_channels
            .into_iter()
            .map(|channel| UnhealthyChannel {
                last_check: channel.last_check_rfc3339(),
                id: channel.id,
                name: channel.name,
                url: channel.url,
            })
            .collect(),
    }))
}

/// Liveness check: is the process responsive?
async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime,
            "active_sessions": state.gateway.registry().len(),
        })),
    )
}

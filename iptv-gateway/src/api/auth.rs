//! Viewer token authentication for operational endpoints.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, Uri, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};

use crate::api::error::ApiError;
use crate::api::server::AppState;

/// Token from `Authorization: Bearer ...`, or else the `token` query parameter.
pub fn request_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from);

    bearer.or_else(|| {
        let query = uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

/// Reject requests without a token that resolves to an active viewer.
///
/// The resolved viewer is stored in the request extensions.
pub async fn require_viewer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request_token(request.headers(), request.uri())
        .ok_or_else(|| ApiError::unauthorized("Missing authorization token"))?;

    let viewer = state
        .viewers
        .resolve_viewer_by_token(&token)
        .await?
        .ok_or_else(|| {
            tracing::warn!("Invalid viewer token on operational endpoint");
            ApiError::unauthorized("Invalid token")
        })?;

    request.extensions_mut().insert(viewer);
    Ok(next.run(request).await)
}

//! Operator authentication for the management API.
//!
//! A single static bearer token (`WATCHMAN_API_TOKEN`) guards rule CRUD and
//! logout. The inbound webhook path is authenticated by its per-rule token
//! instead and never passes through here.

use crate::server::AppState;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Middleware guarding management routes.
pub async fn require_operator(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_token.as_deref() else {
        // No token configured: development mode, management API is open.
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "rejected unauthenticated management request");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthorized",
                    "message": "missing or invalid bearer token"
                })),
            )
                .into_response()
        }
    }
}

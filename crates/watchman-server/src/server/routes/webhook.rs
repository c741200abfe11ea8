//! Inbound push webhook.
//!
//! POST /webhook/v1/:token - receive a push delivery and relay it
//!
//! The endpoint acknowledges every delivery with 200 regardless of outcome,
//! so a stale rule or an offline channel never causes the sender to mark the
//! hook as failing. The token is the only authentication.

use crate::server::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/v1/:token", post(receive_webhook_handler))
        .with_state(state)
}

/// POST /webhook/v1/:token
async fn receive_webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    body: Bytes,
) -> Json<Value> {
    debug!(bytes = body.len(), "webhook delivery received");
    state.dispatcher.dispatch(&token, &body).await;
    Json(json!({ "status": "ok" }))
}

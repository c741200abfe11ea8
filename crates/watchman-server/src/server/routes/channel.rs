//! Channel session API.
//!
//! - GET /v1/channel/status - current session status snapshot
//! - GET /v1/channel/events - WebSocket stream of status events
//! - GET /v1/targets - joined groups the session can send to (management)
//! - POST /v1/channel/logout - sign out and restart pairing (management)

use super::ApiError;
use crate::server::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use watchman_channel::TargetInfo;
use watchman_core::{BroadcastError, SessionStatus, StatusEvent};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/channel/status", get(status_handler))
        .route("/v1/channel/events", get(events_handler))
        .with_state(state)
}

/// Routes for the operator only; mounted behind the bearer token.
pub fn management_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/targets", get(targets_handler))
        .route("/v1/channel/logout", post(logout_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: SessionStatus,
    pairing_challenge: Option<String>,
}

impl StatusResponse {
    fn snapshot(state: &AppState) -> Self {
        let snapshot = state.channel.snapshot();
        Self {
            status: snapshot.status,
            pairing_challenge: snapshot.pairing_challenge,
        }
    }
}

/// GET /v1/channel/status
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse::snapshot(&state))
}

/// POST /v1/channel/logout
///
/// Signs the account out of the messaging network, purges its credentials,
/// and immediately starts a fresh pairing cycle.
async fn logout_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    info!("operator requested channel logout");
    state.channel.logout().await?;
    Ok(Json(StatusResponse::snapshot(&state)))
}

#[derive(Debug, Serialize)]
struct TargetsResponse {
    targets: Vec<TargetInfo>,
}

/// GET /v1/targets
///
/// Lists the groups and chats the paired account has joined, so the operator
/// can pick a rule's `targetId`. Unavailable while the channel is offline.
async fn targets_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TargetsResponse>, ApiError> {
    let targets = state.channel.targets().await?;
    Ok(Json(TargetsResponse { targets }))
}

/// GET /v1/channel/events
///
/// Upgrades to a WebSocket and streams status and pairing-challenge events
/// as JSON. The current status is sent first so a late subscriber does not
/// have to wait for the next transition.
async fn events_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state))
}

async fn handle_events_socket(mut socket: WebSocket, state: Arc<AppState>) {
    debug!("status event subscriber connected");
    let mut subscription = state.channel.subscribe();

    // Snapshot first, then the live stream.
    let snapshot = StatusEvent::Status(state.channel.status());
    if send_event(&mut socket, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(BroadcastError::Lagged(skipped)) => {
                    // Resync with the current status instead of dropping the
                    // subscriber.
                    warn!(skipped, "status subscriber lagged, resyncing");
                    let current = StatusEvent::Status(state.channel.status());
                    if send_event(&mut socket, &current).await.is_err() {
                        break;
                    }
                }
                Err(BroadcastError::Closed) => break,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(error = %error, "status subscriber socket error");
                    break;
                }
            },
        }
    }

    debug!("status event subscriber disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &StatusEvent) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(json)).await
}

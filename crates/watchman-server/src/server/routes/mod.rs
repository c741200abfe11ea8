//! HTTP route modules and the shared API error type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::error;
use watchman_channel::ChannelError;

pub mod channel;
pub mod rules;
pub mod webhook;

/// Error body shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// Errors the management API surfaces to clients.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    InvalidInput(String),
    Database(crate::db::DbError),
    Channel(ChannelError),
}

impl From<crate::db::DbError> for ApiError {
    fn from(error: crate::db::DbError) -> Self {
        ApiError::Database(error)
    }
}

impl From<ChannelError> for ApiError {
    fn from(error: ChannelError) -> Self {
        ApiError::Channel(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("not_found", &message),
            ),
            ApiError::InvalidInput(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("invalid_input", &message),
            ),
            ApiError::Database(db_error) => {
                error!(error = %db_error, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("database_error", "internal database error"),
                )
            }
            ApiError::Channel(channel_error) => {
                // A not-ready channel is a temporary outage from the
                // operator's point of view.
                let status = match &channel_error {
                    ChannelError::NotReady(_) | ChannelError::TaskStopped => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::BAD_GATEWAY,
                };
                (
                    status,
                    ErrorResponse::new("channel_error", &channel_error.to_string()),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

//! Relay errors for the HTTP surface and the client transport.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Relay error type.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Engine error: {0}")]
    Engine(#[from] stow_engine::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Failed to connect to relay at {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Relay protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Protocol(err.to_string())
    }
}

impl From<RelayError> for stow_engine::Error {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Engine(e) => e,
            other => stow_engine::Error::backend("relay", other),
        }
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::Engine(e) => {
                tracing::warn!("Engine error: {:?}", e);
                StatusCode::BAD_REQUEST
            }
            RelayError::BadRequest(_) | RelayError::Protocol(_) => StatusCode::BAD_REQUEST,
            RelayError::Connect { .. } => StatusCode::BAD_GATEWAY,
            RelayError::Io(e) => {
                tracing::error!("I/O error: {:?}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
        });

        (status, body).into_response()
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

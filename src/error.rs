//! Error types for the daemon core.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error kinds surfaced by the scheduler and runner layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("not enough memory: {0}")]
    Capacity(String),

    #[error("no compatible runner variant: {0}")]
    NoBackend(String),

    #[error("could not start runner: {0}")]
    Spawn(String),

    #[error("runner returned {status}: {body}")]
    TransportHttp { status: u16, body: String },

    #[error("malformed runner stream: {0}")]
    StreamMalformed(String),

    #[error("runner exited: {0}")]
    RunnerCrashed(String),

    #[error("runner slot busy, retries exhausted")]
    SlotBusyExhausted,

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "model_not_found"),
            Error::Config(_) => (StatusCode::BAD_REQUEST, "invalid_configuration"),
            Error::Capacity(_) => (StatusCode::SERVICE_UNAVAILABLE, "insufficient_memory"),
            Error::NoBackend(_) => (StatusCode::INTERNAL_SERVER_ERROR, "no_backend"),
            Error::Spawn(_) => (StatusCode::INTERNAL_SERVER_ERROR, "runner_start_failed"),
            Error::TransportHttp { .. } => (StatusCode::BAD_GATEWAY, "runner_error"),
            Error::StreamMalformed(_) => (StatusCode::BAD_GATEWAY, "runner_stream_malformed"),
            Error::RunnerCrashed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "runner_crashed"),
            Error::SlotBusyExhausted => (StatusCode::SERVICE_UNAVAILABLE, "runner_busy"),
            Error::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, "cancelled"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, crate::error::RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Upstream answered with a non-success status.
    #[error("status: {status}, error: {body}")]
    UpstreamHttp { status: u16, body: String },

    /// Connect, TLS or body read failure talking to upstream.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            RelayError::UpstreamHttp { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::MalformedInput(e.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        error!("request failed: {}", self);
        let body = Json(json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

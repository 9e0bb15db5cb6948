//! Unified HTTP error type for the relay.
//!
//! [`RelayError`] names every way a chat request can fail and converts itself
//! into an HTTP response via [`IntoResponse`]. Handlers return
//! `Result<T, RelayError>` and propagate with `?`.
//!
//! The same error can surface after an SSE stream has already started; in
//! that case [`RelayError::to_sse_frame`] renders it as a final `data:` frame
//! instead, because the status line has already been sent.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tokio_util::codec::LinesCodecError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Requested model is not on the allow-list.
    #[error("Model {model} is not allowed. Allowed models are: {allowed}")]
    UnsupportedModel { model: String, allowed: String },

    /// Bearer token missing or not equal to the shared secret.
    #[error("Invalid APP_SECRET")]
    InvalidSecret,

    /// Upstream answered with a non-2xx status.
    #[error("upstream returned HTTP {status}: {body}")]
    UpstreamStatus { status: StatusCode, body: String },

    /// Connection failure, timeout, or a broken body mid-read.
    #[error("upstream request failed: {0}")]
    Transport(String),

    /// An upstream line that is not a well-formed envelope.
    #[error("malformed upstream envelope: {0}")]
    MalformedEnvelope(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedModel { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidSecret => StatusCode::FORBIDDEN,
            Self::UpstreamStatus { status, .. } => *status,
            Self::Transport(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MalformedEnvelope(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// OpenAI-style error `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedModel { .. } => "invalid_request_error",
            Self::InvalidSecret => "authentication_error",
            Self::UpstreamStatus { .. } => "upstream_error",
            Self::Transport(_) | Self::Internal(_) => "server_error",
            Self::MalformedEnvelope(_) => "malformed_upstream_response",
        }
    }

    /// Render as a terminal SSE frame for failures after streaming began.
    pub fn to_sse_frame(&self) -> String {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": self.status().as_u16(),
            }
        });
        format!("data: {body}\n\n")
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<LinesCodecError> for RelayError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => {
                Self::MalformedEnvelope("line exceeds maximum length".into())
            }
            LinesCodecError::Io(io) if io.kind() == std::io::ErrorKind::InvalidData => {
                Self::MalformedEnvelope(format!("line is not valid UTF-8: {io}"))
            }
            LinesCodecError::Io(io) => Self::Transport(io.to_string()),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, %status, "request failed");
        } else {
            tracing::warn!(error = %self, %status, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

//! Error types for the HTTP front end.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use sandrun_core::{ErrorClass, SandboxError};
use serde_json::json;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Missing, malformed or empty submission
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Submission over the source ceiling
    #[error("Submission of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// Multipart envelope could not be read
    #[error("Multipart error: {0}")]
    Multipart(#[from] MultipartError),

    /// The run was abandoned because the server is stopping
    #[error("Server is shutting down")]
    ShuttingDown,

    /// The run was abandoned because the client went away
    #[error("Client closed the request")]
    ClientClosed,

    /// Server configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::BadRequest(_) => 400,
            ServerError::PayloadTooLarge { .. } => 413,
            ServerError::Multipart(e) => e.status().as_u16(),
            ServerError::ShuttingDown => 503,
            // nginx's "client closed request"; nobody is left to read it.
            ServerError::ClientClosed => 499,
            ServerError::Config(_) | ServerError::Io(_) | ServerError::Internal(_) => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::BadRequest(_) => "bad_request",
            ServerError::PayloadTooLarge { .. } => "payload_too_large",
            ServerError::Multipart(_) => "multipart_error",
            ServerError::ShuttingDown => "shutting_down",
            ServerError::ClientClosed => "client_closed",
            ServerError::Config(_) => "config_error",
            ServerError::Io(_) => "io_error",
            ServerError::Internal(_) => "internal_error",
        }
    }
}

impl From<SandboxError> for ServerError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::SubmissionTooLarge { size, limit } => {
                ServerError::PayloadTooLarge { size, limit }
            }
            err if err.class() == ErrorClass::BadRequest => ServerError::BadRequest(err.to_string()),
            err => ServerError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // 5xx bodies never carry infrastructure detail; that stays in the log.
        let body = match self {
            // Cancellations are expected during shutdown or disconnects; the
            // handler has already logged them with the request id.
            ServerError::ShuttingDown => {
                log::debug!("{}", self);
                json!({ "error": "Server shutting down" })
            }
            ServerError::ClientClosed => {
                log::debug!("{}", self);
                json!({ "error": self.to_string(), "type": self.error_type() })
            }
            _ if status.is_server_error() => {
                log::error!("{} ({})", self, self.error_type());
                json!({ "error": "Internal Error" })
            }
            _ => {
                log::warn!("rejected request: {}", self);
                json!({ "error": self.to_string(), "type": self.error_type() })
            }
        };

        (status, Json(body)).into_response()
    }
}

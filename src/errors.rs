use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::mcp::rpc::{json_rpc_error_without_id, INTERNAL_ERROR, SESSION_REQUIRED};

pub const NO_VALID_SESSION_MESSAGE: &str = "Bad Request: No valid session ID provided";

/// Errors raised by capability handlers.
///
/// These never reach the HTTP layer directly; `mcp::rpc::app_error_to_json_rpc`
/// maps them onto JSON-RPC error objects.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {message}")]
    BadRequest {
        code: &'static str,
        message: &'static str,
    },
    #[error("not found: {message}")]
    NotFound {
        code: &'static str,
        message: String,
    },
    #[error("internal error")]
    Internal { code: &'static str, message: String },
}

impl AppError {
    pub fn bad_request(code: &'static str, message: &'static str) -> Self {
        Self::BadRequest { code, message }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }
}

/// Failures of the session-routing layer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no valid session id provided")]
    InvalidSession,
    #[error("session {0} is already registered")]
    DuplicateSession(String),
    #[error("failed to provision session: {0}")]
    Provisioning(String),
}

impl SessionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidSession => StatusCode::BAD_REQUEST,
            Self::DuplicateSession(_) | Self::Provisioning(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::InvalidSession => {
                json_rpc_error_without_id(SESSION_REQUIRED, NO_VALID_SESSION_MESSAGE)
            }
            Self::DuplicateSession(_) | Self::Provisioning(_) => {
                tracing::error!(error = %self, "session setup failed");
                json_rpc_error_without_id(INTERNAL_ERROR, "Internal error")
            }
        };

        (status, Json(body)).into_response()
    }
}

/// Failures of a single transport instance.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already has a protocol handler bound")]
    AlreadyConnected,
    #[error("transport has no protocol handler bound")]
    NotConnected,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        Self::Provisioning(err.to_string())
    }
}

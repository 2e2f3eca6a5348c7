//! Error taxonomy shared by the control plane, the provisioner and the terminal bridge.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("missing required parameter '{0}'")]
    MissingParameter(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to start container: {0}")]
    ProvisionError(String),
    #[error("container failed to start after {attempts} readiness checks")]
    ProvisionTimeout { attempts: u32 },
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session {0} is not ready")]
    SessionNotReady(String),
    #[error("session {0} already has an attached terminal")]
    AlreadyAttached(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("command '{command}' failed: {message}")]
    Runtime { command: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn status(&self) -> StatusCode {
        match self {
            SandboxError::InvalidPath(_)
            | SandboxError::MissingParameter(_)
            | SandboxError::InvalidRequest(_)
            | SandboxError::MalformedFrame(_) => StatusCode::BAD_REQUEST,
            SandboxError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            SandboxError::SessionNotReady(_) | SandboxError::AlreadyAttached(_) => {
                StatusCode::CONFLICT
            }
            SandboxError::ProvisionError(_)
            | SandboxError::ProvisionTimeout { .. }
            | SandboxError::Runtime { .. }
            | SandboxError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let body = ErrorBody {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;

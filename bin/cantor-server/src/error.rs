//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.
//!
//! Server-side runtime failures are logged with full detail but only a generic
//! message is returned to the caller so that file paths and process output
//! never leak.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cantor_core::RuntimeError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// All errors that can occur in the cantor-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the generation runtime.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The upload exceeds the configured limit.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
}

impl ServerError {
    pub(crate) fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m.clone()),
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.clone()),
            ServerError::PayloadTooLarge(m) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", m.clone())
            }
            ServerError::Runtime(e) => {
                let status = match e {
                    RuntimeError::Validation { .. } => StatusCode::BAD_REQUEST,
                    RuntimeError::TaskNotFound { .. } | RuntimeError::ArtifactNotFound { .. } => {
                        StatusCode::NOT_FOUND
                    }
                    RuntimeError::NotReady { .. } | RuntimeError::InvalidTransition { .. } => {
                        StatusCode::CONFLICT
                    }
                    RuntimeError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
                    RuntimeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    RuntimeError::ResourceExhausted { .. }
                    | RuntimeError::Inference { .. }
                    | RuntimeError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let message = if status.is_server_error() {
                    error!(error = %e, kind = e.kind(), "generation runtime error");
                    match e {
                        RuntimeError::ResourceExhausted { .. } => {
                            "GPU resources exhausted; try a shorter clip or retry later".to_owned()
                        }
                        RuntimeError::Timeout { .. } | RuntimeError::Shutdown => e.to_string(),
                        _ => "generation backend error".to_owned(),
                    }
                } else {
                    e.to_string()
                };
                (status, e.kind(), message)
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

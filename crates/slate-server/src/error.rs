//! HTTP error types for the Slate server.
//!
//! Maps domain errors from `slate-core` into HTTP responses. Every error
//! produces a JSON body with a machine-readable `error` field and a
//! human-readable `message`. Server-side failures are logged here with
//! their full context and reach the client only as a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use slate_core::error::{ContentError, SessionError};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Requested resource not found.
    NotFound(String),
    /// Client sent invalid input.
    BadRequest(String),
    /// The content ceiling would be exceeded.
    Conflict(String),
    /// Internal server error. The string is logged, not returned.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<ContentError> for AppError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::NotFound { .. } => Self::NotFound(err.to_string()),
            ContentError::Validation { .. } => Self::BadRequest(err.to_string()),
            ContentError::Capacity { .. } => Self::Conflict(err.to_string()),
            ContentError::LockTimeout { .. }
            | ContentError::Serialization { .. }
            | ContentError::Storage(_)
            | ContentError::Session(_)
            | ContentError::Internal { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        Self::Internal(err.to_string())
    }
}

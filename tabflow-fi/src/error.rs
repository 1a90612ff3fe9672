//! Error types for tabflow-fi
//!
//! Client input errors, access denials and not-found/not-ready conditions
//! carry caller-facing messages. Internal failures are logged and surfaced
//! with a generic message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing/invalid identifiers, malformed mapping, out-of-range index (400)
    #[error("{0}")]
    BadRequest(String),

    /// Origin not allowlisted, missing or unparseable (401)
    #[error("{0}")]
    AccessDenied(String),

    /// Unknown importer, upload or import (404)
    #[error("{0}")]
    NotFound(String),

    /// Resource exists but is still being processed; poll again (409)
    #[error("{0}")]
    NotReady(String),

    /// Conflicting state, e.g. materialization already claimed (409)
    #[error("{0}")]
    Conflict(String),

    /// Materialization ended with a terminal error (422)
    #[error("{0}")]
    ImportFailed(String),

    /// Transfer chunk or declared length over the limit (413)
    #[error("{0}")]
    PayloadTooLarge(String),

    /// Transfer chunk sent with the wrong content type (415)
    #[error("{0}")]
    UnsupportedMediaType(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Store or configuration error from tabflow-common
    #[error(transparent)]
    Common(#[from] tabflow_common::Error),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::AccessDenied(msg) => (StatusCode::UNAUTHORIZED, "ACCESS_DENIED", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::NotReady(msg) => (StatusCode::CONFLICT, "NOT_READY", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::ImportFailed(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "IMPORT_FAILED", msg.clone())
            }
            ApiError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", msg.clone())
            }
            ApiError::UnsupportedMediaType(msg) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED_MEDIA_TYPE",
                msg.clone(),
            ),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred. Please try again or contact support.".to_string(),
            ),
            ApiError::Common(err) => match err {
                tabflow_common::Error::NotFound(msg) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone())
                }
                tabflow_common::Error::InvalidInput(msg) => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone())
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred. Please try again or contact support.".to_string(),
                ),
            },
        }
    }

    /// HTTP status this error maps to
    pub fn status(&self) -> StatusCode {
        self.parts().0
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = self.parts();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed with internal error");
        }

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers and pipeline operations
pub type ApiResult<T> = Result<T, ApiError>;

//! HTTP API handlers for tabflow-fi
//!
//! All file-import routes live under `/file-import/v1`. Request bodies are
//! read as raw bytes and decoded here so malformed input is reported in the
//! same JSON error shape as every other failure.

pub mod health;
pub mod import;
pub mod importer;
pub mod sse;
pub mod transfer;
pub mod upload;

pub use health::health_routes;

use axum::body::Bytes;
use axum::http::{header, HeaderMap};
use axum::routing::get;
use axum::Router;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Prefix of every file-import route
pub const API_PREFIX: &str = "/file-import/v1";

/// All file-import routes, unprefixed
pub fn file_import_routes() -> Router<AppState> {
    Router::new()
        .merge(transfer::transfer_routes())
        .merge(importer::importer_routes())
        .merge(upload::upload_routes())
        .merge(import::import_routes())
        .route("/events", get(sse::event_stream))
}

/// Origin the request claims to come from (Referer, else Origin)
pub(crate) fn request_origin(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::REFERER)
        .or_else(|| headers.get(header::ORIGIN))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub(crate) fn parse_id(value: &str, what: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(value.trim())
        .map_err(|_| ApiError::BadRequest(format!("Invalid {} ID '{}'", what, value)))
}

/// Decode a JSON body; `None` for an empty (or `null`) body
pub(crate) fn parse_json_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<Option<T>> {
    let text = std::str::from_utf8(body)
        .map_err(|_| ApiError::BadRequest("Request body must be UTF-8".to_string()))?
        .trim();
    if text.is_empty() || text == "null" {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))
}

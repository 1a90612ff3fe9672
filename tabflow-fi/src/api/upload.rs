//! Upload preview, header row selection and column mapping

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::collections::HashMap;

use super::{parse_id, parse_json_body, request_origin};
use crate::error::ApiResult;
use crate::models::{Upload, UploadPreview};
use crate::pipeline::MaterializationStarted;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct HeaderRowRequest {
    pub index: Option<i64>,
}

/// GET /upload/:tus_id
pub async fn get_upload(
    State(state): State<AppState>,
    Path(tus_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<UploadPreview>> {
    let preview = state
        .pipeline
        .get_upload_preview(&tus_id, request_origin(&headers).as_deref())
        .await?;
    Ok(Json(preview))
}

/// POST /upload/:upload_id/set-header-row
pub async fn set_header_row(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Upload>> {
    let upload_id = parse_id(&upload_id, "upload")?;
    let request = parse_json_body::<HeaderRowRequest>(&body)?.unwrap_or_default();

    let upload = state
        .pipeline
        .set_header_row(upload_id, request.index, request_origin(&headers).as_deref())
        .await?;
    Ok(Json(upload))
}

/// POST /upload/:upload_id/set-column-mapping
///
/// Body maps upload column ids to template column ids (or to new keys for
/// schemaless uploads).
pub async fn set_column_mapping(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<MaterializationStarted>> {
    let upload_id = parse_id(&upload_id, "upload")?;
    let mapping = parse_json_body::<HashMap<String, String>>(&body)?.unwrap_or_default();

    let started = state
        .pipeline
        .set_column_mapping(upload_id, mapping, request_origin(&headers).as_deref())
        .await?;
    Ok(Json(started))
}

pub fn upload_routes() -> Router<AppState> {
    Router::new()
        .route("/upload/:id", get(get_upload))
        .route("/upload/:id/set-header-row", post(set_header_row))
        .route("/upload/:id/set-column-mapping", post(set_column_mapping))
}

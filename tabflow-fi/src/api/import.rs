//! Import review, filtered rows and submit

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};

use super::{parse_id, request_origin};
use crate::error::{ApiError, ApiResult};
use crate::models::{ImportView, SubmittedImport};
use crate::pagination::{ImportData, RowsQuery};
use crate::AppState;

/// GET /import/:upload_id/review
pub async fn review_import(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<ImportView>> {
    let upload_id = parse_id(&upload_id, "upload")?;
    let view = state
        .pipeline
        .review_import(upload_id, request_origin(&headers).as_deref())
        .await?;
    Ok(Json(view))
}

/// GET /import/:upload_id/rows?offset=&limit=&filter=
pub async fn import_rows(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    query: Result<Query<RowsQuery>, QueryRejection>,
    headers: HeaderMap,
) -> ApiResult<Json<ImportData>> {
    let upload_id = parse_id(&upload_id, "upload")?;
    let Query(query) =
        query.map_err(|e| ApiError::BadRequest(format!("Invalid query parameters: {}", e.body_text())))?;

    let data = state
        .pipeline
        .import_rows(upload_id, &query, request_origin(&headers).as_deref())
        .await?;
    Ok(Json(data))
}

/// POST /import/:upload_id/submit
pub async fn submit_import(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<SubmittedImport>> {
    let upload_id = parse_id(&upload_id, "upload")?;
    let submitted = state
        .pipeline
        .submit_import(upload_id, request_origin(&headers).as_deref())
        .await?;
    Ok(Json(submitted))
}

pub fn import_routes() -> Router<AppState> {
    Router::new()
        .route("/import/:upload_id/review", get(review_import))
        .route("/import/:upload_id/rows", get(import_rows))
        .route("/import/:upload_id/submit", post(submit_import))
}

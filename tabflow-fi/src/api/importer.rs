//! Importer lookup

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde::Deserialize;

use super::{parse_id, parse_json_body, request_origin};
use crate::error::ApiResult;
use crate::models::{Importer, TemplateDefinition};
use crate::pipeline::TemplateMode;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ImporterQuery {
    #[serde(default)]
    pub schemaless: bool,
}

/// POST /importer/:importer_id
///
/// `?schemaless=true` wins over a template in the body.
pub async fn get_importer(
    State(state): State<AppState>,
    Path(importer_id): Path<String>,
    Query(query): Query<ImporterQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Importer>> {
    let importer_id = parse_id(&importer_id, "importer")?;

    let mode = if query.schemaless {
        TemplateMode::Schemaless
    } else {
        match parse_json_body::<TemplateDefinition>(&body)? {
            Some(definition) => TemplateMode::Override(definition),
            None => TemplateMode::Stored,
        }
    };

    let importer = state
        .pipeline
        .get_importer(importer_id, request_origin(&headers).as_deref(), mode)
        .await?;

    Ok(Json(importer))
}

pub fn importer_routes() -> Router<AppState> {
    Router::new().route("/importer/:importer_id", post(get_importer))
}

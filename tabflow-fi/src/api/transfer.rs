//! tus endpoints: create, HEAD, PATCH and capability discovery

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};

use super::{header_str, request_origin, API_PREFIX};
use crate::error::{ApiError, ApiResult};
use crate::transfer::{CreateTransfer, TransferStatus, UploadMetadata};
use crate::AppState;

pub const TUS_VERSION: &str = "1.0.0";

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const IMPORTER_ID: HeaderName = HeaderName::from_static("x-importer-id");

fn parse_u64_header(headers: &HeaderMap, name: &HeaderName) -> ApiResult<Option<u64>> {
    header_str(headers, name.as_str())
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| ApiError::BadRequest(format!("Invalid {} header '{}'", name, v)))
        })
        .transpose()
}

fn status_headers(status: &TransferStatus) -> [(HeaderName, HeaderValue); 3] {
    [
        (TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION)),
        (UPLOAD_OFFSET, HeaderValue::from(status.offset)),
        (UPLOAD_LENGTH, HeaderValue::from(status.length)),
    ]
}

/// POST /files
pub async fn create_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let request = CreateTransfer {
        importer_id: header_str(&headers, IMPORTER_ID.as_str()).map(str::to_string),
        upload_length: parse_u64_header(&headers, &UPLOAD_LENGTH)?,
        metadata: UploadMetadata::parse(header_str(&headers, UPLOAD_METADATA.as_str()))?,
        referer: request_origin(&headers),
    };

    let upload = state.transfers.create(request).await?;
    let status = TransferStatus::from(&upload);
    let location = format!("{}/files/{}", API_PREFIX, upload.tus_id);

    let mut response = (StatusCode::CREATED, status_headers(&status), Json(upload)).into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    Ok(response)
}

/// HEAD /files/:tus_id
pub async fn transfer_offset(
    State(state): State<AppState>,
    Path(tus_id): Path<String>,
) -> ApiResult<Response> {
    let status = state.transfers.head(&tus_id).await?;
    Ok((
        StatusCode::OK,
        status_headers(&status),
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
    )
        .into_response())
}

/// PATCH /files/:tus_id
pub async fn append_chunk(
    State(state): State<AppState>,
    Path(tus_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let offset = parse_u64_header(&headers, &UPLOAD_OFFSET)?;
    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str());

    let status = state
        .transfers
        .patch(&tus_id, offset, content_type, body)
        .await?;

    Ok((StatusCode::NO_CONTENT, status_headers(&status)).into_response())
}

/// OPTIONS /files
pub async fn transfer_options(State(state): State<AppState>) -> Response {
    let max_size = state.pipeline.config().max_upload_bytes;
    (
        StatusCode::NO_CONTENT,
        [
            (TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION)),
            (TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION)),
            (TUS_EXTENSION, HeaderValue::from_static("creation")),
            (TUS_MAX_SIZE, HeaderValue::from(max_size)),
        ],
    )
        .into_response()
}

/// Build transfer routes
pub fn transfer_routes() -> Router<AppState> {
    Router::new()
        .route("/files", post(create_transfer).options(transfer_options))
        .route(
            "/files/:tus_id",
            axum::routing::head(transfer_offset).patch(append_chunk),
        )
}

/// Body limit for PATCH chunks
pub fn chunk_limit(max_chunk_bytes: usize) -> DefaultBodyLimit {
    DefaultBodyLimit::max(max_chunk_bytes)
}

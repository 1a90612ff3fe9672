//! tabflow-fi library interface
//!
//! File-import microservice: resumable transfer, header-row selection,
//! column mapping, asynchronous materialization, filtered review and submit.

pub mod api;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod pagination;
pub mod pipeline;
pub mod store;
pub mod transfer;

pub use crate::error::{ApiError, ApiResult};

use axum::http::HeaderName;
use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tabflow_common::{EventBus, PipelineConfig};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::pipeline::ImportPipeline;
use crate::store::{SqliteMetadataStore, SqliteRowStore};
use crate::transfer::TransferService;

/// Events buffered per SSE subscriber
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ImportPipeline>,
    pub transfers: Arc<TransferService>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(pipeline: Arc<ImportPipeline>, uploads_dir: PathBuf) -> Self {
        let event_bus = pipeline.events().clone();
        Self {
            transfers: Arc::new(TransferService::new(pipeline.clone(), uploads_dir)),
            pipeline,
            event_bus,
            startup_time: Utc::now(),
        }
    }

    /// State backed by the SQLite stores on `pool`
    pub fn from_pool(pool: SqlitePool, config: PipelineConfig, uploads_dir: PathBuf) -> Self {
        let pipeline = ImportPipeline::new(
            Arc::new(SqliteMetadataStore::new(pool.clone())),
            Arc::new(SqliteRowStore::new(pool)),
            Arc::new(config),
            EventBus::new(EVENT_BUS_CAPACITY),
        );
        Self::new(Arc::new(pipeline), uploads_dir)
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use api::transfer::{TUS_EXTENSION, TUS_MAX_SIZE, TUS_RESUMABLE, TUS_VERSION_HEADER, UPLOAD_LENGTH, UPLOAD_OFFSET};

    // tus clients read these from cross-origin responses
    let exposed: [HeaderName; 7] = [
        axum::http::header::LOCATION,
        TUS_RESUMABLE,
        TUS_VERSION_HEADER,
        TUS_EXTENSION,
        TUS_MAX_SIZE,
        UPLOAD_OFFSET,
        UPLOAD_LENGTH,
    ];
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(exposed);

    let chunk_limit = api::transfer::chunk_limit(state.pipeline.config().max_chunk_bytes);

    Router::new()
        .nest(api::API_PREFIX, api::file_import_routes())
        .merge(api::health_routes())
        .layer(chunk_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

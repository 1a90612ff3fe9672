//! Metadata and row stores
//!
//! The pipeline only talks to these traits. `SqliteMetadataStore` and
//! `SqliteRowStore` are the implementations the service runs with; each
//! owns its own retry policy and reports plain success/failure.

mod metadata;
mod rows;

pub use metadata::SqliteMetadataStore;
pub use rows::SqliteRowStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tabflow_common::Result;
use uuid::Uuid;

use crate::models::{Import, ImportRow, Importer, Template, Upload, UploadColumn, UploadRow};
use crate::pagination::{ImportRowFilter, PageRequest};

/// Hard ceiling on rows returned by a single unbounded read
pub const MAX_ALL_ROW_RETRIEVAL: u64 = 100_000;

/// What a column mapping commits when it starts materialization
#[derive(Debug, Clone, Copy)]
pub struct MaterializationClaim<'a> {
    pub import: &'a Import,
    /// Header row the mapping was resolved against
    pub header_row_index: u64,
    /// Synthesized template of a schemaless upload
    pub template: Option<&'a Template>,
    /// Upload column id -> template column id
    pub mapping: &'a HashMap<Uuid, Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// The upload already carries an import
    AlreadyClaimed,
    /// The header row or its columns were replaced after the mapping was read
    HeaderChanged,
}

/// Importer, template, upload and import records
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Importer with its template attached
    async fn get_importer(&self, id: Uuid) -> Result<Option<Importer>>;

    async fn get_importer_without_template(&self, id: Uuid) -> Result<Option<Importer>>;

    async fn get_template_by_importer(&self, importer_id: Uuid) -> Result<Option<Template>>;

    /// Insert or replace an importer and its template
    async fn upsert_importer(&self, importer: &Importer) -> Result<()>;

    async fn create_upload(&self, upload: &Upload) -> Result<()>;

    /// Upload with its columns, ordered by column index
    async fn get_upload(&self, id: Uuid) -> Result<Option<Upload>>;

    async fn get_upload_by_tus_id(&self, tus_id: &str) -> Result<Option<Upload>>;

    /// Move the transfer offset from `expected` to `new`
    ///
    /// Returns false when the stored offset is not `expected`.
    async fn advance_upload_offset(&self, id: Uuid, expected: u64, new: u64) -> Result<bool>;

    async fn mark_upload_stored(&self, id: Uuid, num_rows: u64, num_columns: u64) -> Result<()>;

    async fn set_upload_error(&self, id: Uuid, error: &str) -> Result<()>;

    /// Persist the header row and its derived columns
    ///
    /// Returns false, writing nothing, once an import has been claimed.
    async fn save_header_row(
        &self,
        upload_id: Uuid,
        header_row_index: u64,
        columns: &[UploadColumn],
    ) -> Result<bool>;

    async fn import_exists_for_upload(&self, upload_id: Uuid) -> Result<bool>;

    /// Record the claim's import as the upload's materialization, insert it
    /// and persist the column mapping, in one transaction
    ///
    /// Nothing is written unless the upload has no import yet, its header
    /// row is still `header_row_index` and every mapped upload column still
    /// exists.
    async fn claim_materialization(&self, claim: &MaterializationClaim<'_>) -> Result<ClaimOutcome>;

    async fn get_import(&self, id: Uuid) -> Result<Option<Import>>;

    async fn get_import_by_upload_id(&self, upload_id: Uuid) -> Result<Option<Import>>;

    async fn update_import_counters(&self, import: &Import) -> Result<()>;

    /// Write final counters and mark the import stored
    async fn complete_import(&self, import: &Import) -> Result<()>;

    /// Record a terminal materialization error on the import and its upload
    async fn fail_import(&self, import_id: Uuid, upload_id: Uuid, error: &str) -> Result<()>;

    /// Set `submitted_at` if it is unset; returns true for the call that set it
    async fn mark_import_submitted(&self, import_id: Uuid, at: DateTime<Utc>) -> Result<bool>;
}

/// Raw uploaded rows and validated import rows
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn insert_upload_rows(&self, upload_id: Uuid, rows: &[UploadRow]) -> Result<()>;

    /// Up to `count` raw rows starting at row index `offset`
    async fn paginate_upload_rows(
        &self,
        upload_id: Uuid,
        offset: u64,
        count: u64,
    ) -> Result<Vec<UploadRow>>;

    /// Insert validated rows; rewriting a row with the same index replaces it
    async fn insert_import_rows(&self, import_id: Uuid, rows: &[ImportRow]) -> Result<()>;

    async fn paginate_import_rows(
        &self,
        import_id: Uuid,
        page: PageRequest,
        filter: ImportRowFilter,
    ) -> Result<Vec<ImportRow>>;

    /// Every row of an import, in index order, up to `max` rows
    async fn all_import_rows(&self, import_id: Uuid, max: u64) -> Result<Vec<ImportRow>>;
}

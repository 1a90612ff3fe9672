//! Upload-to-import pipeline
//!
//! `ImportPipeline` owns the transitions of an upload: header-row selection,
//! column mapping (which claims and launches materialization), review,
//! filtered reads and submit. Every importer-scoped entry point re-checks the
//! caller's origin against the importer's allowlist.

pub mod guard;
pub mod inference;
pub mod mapping;
pub mod materializer;
mod review;
pub mod validation;

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tabflow_common::{EventBus, PipelineConfig, PipelineEvent};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{Import, Importer, Template, TemplateDefinition, Upload, UploadPreview};
use crate::notify::ImportCompleteHandler;
use crate::store::{ClaimOutcome, MaterializationClaim, MetadataStore, RowStore};

pub use guard::authorize_origin;
pub use mapping::SchemaSource;
pub use materializer::{MaterializationJob, Materializer};

/// Which template an importer lookup returns
#[derive(Debug, Clone)]
pub enum TemplateMode {
    /// The importer's stored template
    Stored,
    /// An empty template; destinations are chosen by the user
    Schemaless,
    /// A template supplied by the caller instead of the stored one
    Override(TemplateDefinition),
}

/// Response to a successful column mapping
#[derive(Debug, Clone, Serialize)]
pub struct MaterializationStarted {
    pub upload_id: Uuid,
    pub import_id: Uuid,
    pub message: String,
}

pub struct ImportPipeline {
    metadata: Arc<dyn MetadataStore>,
    rows: Arc<dyn RowStore>,
    config: Arc<PipelineConfig>,
    events: EventBus,
    complete_handler: Option<Arc<dyn ImportCompleteHandler>>,
}

impl ImportPipeline {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        rows: Arc<dyn RowStore>,
        config: Arc<PipelineConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            metadata,
            rows,
            config,
            events,
            complete_handler: None,
        }
    }

    /// Register the handler invoked once per submitted import
    pub fn with_complete_handler(mut self, handler: Arc<dyn ImportCompleteHandler>) -> Self {
        self.complete_handler = Some(handler);
        self
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn rows(&self) -> &Arc<dyn RowStore> {
        &self.rows
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn materializer(&self) -> Materializer {
        Materializer::new(
            self.metadata.clone(),
            self.rows.clone(),
            self.events.clone(),
            self.config.materialize_batch_size,
        )
    }

    async fn load_importer(&self, importer_id: Uuid) -> ApiResult<Importer> {
        self.metadata
            .get_importer_without_template(importer_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Importer not found".to_string()))
    }

    async fn load_upload(&self, upload_id: Uuid) -> ApiResult<Upload> {
        self.metadata
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Upload not found".to_string()))
    }

    /// Load an upload and check the caller may act on it
    async fn authorized_upload(
        &self,
        upload_id: Uuid,
        referer: Option<&str>,
    ) -> ApiResult<(Upload, Importer)> {
        let upload = self.load_upload(upload_id).await?;
        let importer = self.load_importer(upload.importer_id).await?;
        authorize_origin(&importer, referer)?;
        Ok((upload, importer))
    }

    /// Check the caller may observe `upload_id`
    pub async fn authorize_upload(&self, upload_id: Uuid, referer: Option<&str>) -> ApiResult<()> {
        self.authorized_upload(upload_id, referer).await.map(|_| ())
    }

    /// Importer with the template a client should map against
    pub async fn get_importer(
        &self,
        importer_id: Uuid,
        referer: Option<&str>,
        mode: TemplateMode,
    ) -> ApiResult<Importer> {
        let mut importer = self.load_importer(importer_id).await?;
        authorize_origin(&importer, referer)?;

        let template = match mode {
            TemplateMode::Schemaless => Template::empty(),
            TemplateMode::Override(definition) => {
                definition.into_template().map_err(ApiError::BadRequest)?
            }
            TemplateMode::Stored => {
                let template = self
                    .metadata
                    .get_template_by_importer(importer_id)
                    .await?
                    .ok_or_else(|| {
                        ApiError::BadRequest("Template not attached to importer".to_string())
                    })?;
                if template.columns.is_empty() {
                    return Err(ApiError::BadRequest("No template columns found".to_string()));
                }
                template
            }
        };

        importer.template = Some(template);
        Ok(importer)
    }

    /// Upload summary plus the first raw rows once they are stored
    pub async fn get_upload_preview(
        &self,
        tus_id: &str,
        referer: Option<&str>,
    ) -> ApiResult<UploadPreview> {
        let upload = self
            .metadata
            .get_upload_by_tus_id(tus_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Upload not found".to_string()))?;
        let importer = self.load_importer(upload.importer_id).await?;
        authorize_origin(&importer, referer)?;

        if let Some(error) = &upload.error {
            return Err(ApiError::BadRequest(error.clone()));
        }

        let upload_rows = if upload.is_stored {
            self.rows
                .paginate_upload_rows(upload.id, 0, self.config.preview_rows as u64)
                .await?
        } else {
            Vec::new()
        };

        Ok(UploadPreview {
            upload,
            upload_rows,
        })
    }

    /// Select the header row and derive the upload's columns
    pub async fn set_header_row(
        &self,
        upload_id: Uuid,
        index: Option<i64>,
        referer: Option<&str>,
    ) -> ApiResult<Upload> {
        let index =
            index.ok_or_else(|| ApiError::BadRequest("Missing required parameter 'index'".to_string()))?;

        let (upload, importer) = self.authorized_upload(upload_id, referer).await?;

        if let Some(error) = &upload.error {
            return Err(ApiError::BadRequest(error.clone()));
        }
        if upload.import_id.is_some() || self.metadata.import_exists_for_upload(upload.id).await? {
            return Err(ApiError::BadRequest(
                "The header row cannot be set again since the import is already complete".to_string(),
            ));
        }
        if !upload.is_stored {
            return Err(ApiError::NotReady(
                "The upload is not yet stored, please wait...".to_string(),
            ));
        }

        let index = inference::validate_header_row_index(&upload, index)?;
        self.select_header_row(&upload, &importer, index).await
    }

    /// Derive and persist columns for a validated header row index
    pub(crate) async fn select_header_row(
        &self,
        upload: &Upload,
        importer: &Importer,
        index: u64,
    ) -> ApiResult<Upload> {
        let window = self
            .rows
            .paginate_upload_rows(upload.id, index, self.config.column_sample_rows.max(1) as u64)
            .await?;

        let template = if upload.schemaless {
            None
        } else if upload.template.is_some() {
            upload.template.clone()
        } else {
            self.metadata.get_template_by_importer(importer.id).await?
        };

        let columns = inference::derive_upload_columns(upload.id, &window, template.as_ref());

        if !self.metadata.save_header_row(upload.id, index, &columns).await? {
            return Err(ApiError::BadRequest(
                "The header row cannot be set again since the import is already complete".to_string(),
            ));
        }

        tracing::info!(
            upload_id = %upload.id,
            header_row_index = index,
            num_columns = columns.len(),
            "Header row selected"
        );
        self.events.emit_lossy(PipelineEvent::HeaderRowSelected {
            upload_id: upload.id,
            header_row_index: index,
            num_columns: columns.len(),
            timestamp: Utc::now(),
        });

        self.load_upload(upload.id).await
    }

    /// Apply the column mapping and launch materialization
    ///
    /// Returns as soon as the import is claimed; materialization continues
    /// on a detached task.
    pub async fn set_column_mapping(
        &self,
        upload_id: Uuid,
        raw: HashMap<String, String>,
        referer: Option<&str>,
    ) -> ApiResult<MaterializationStarted> {
        mapping::validate_column_mapping(&raw)?;

        let (upload, importer) = self.authorized_upload(upload_id, referer).await?;

        let Some(header_row_index) = upload.header_row_index else {
            return Err(ApiError::BadRequest("The header row has not been set".to_string()));
        };
        if upload.import_id.is_some() {
            return Err(ApiError::Conflict(
                "An import has already been started for this upload".to_string(),
            ));
        }

        let source = if upload.schemaless {
            SchemaSource::Schemaless
        } else if let Some(template) = &upload.template {
            SchemaSource::UploadTemplate(template.clone())
        } else {
            SchemaSource::ImporterTemplate(self.metadata.get_template_by_importer(importer.id).await?)
        };
        let source_name = source.name();
        let resolved = mapping::resolve_mapping(&upload, source, &raw)?;

        let num_rows = upload
            .num_rows
            .unwrap_or(0)
            .saturating_sub(header_row_index + 1);
        let import = Import::new(
            upload.id,
            upload.importer_id,
            num_rows,
            resolved.columns.len() as u64,
            upload.metadata.clone(),
        );

        let claim = MaterializationClaim {
            import: &import,
            header_row_index,
            template: resolved.synthesized.as_ref(),
            mapping: &resolved.mapping,
        };
        match self.metadata.claim_materialization(&claim).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyClaimed => {
                return Err(ApiError::Conflict(
                    "An import has already been started for this upload".to_string(),
                ));
            }
            ClaimOutcome::HeaderChanged => {
                tracing::info!(
                    upload_id = %upload.id,
                    header_row_index,
                    "Header row changed while the mapping was applied"
                );
                return Err(ApiError::Conflict(
                    "The header row changed while the mapping was applied, please map the columns again"
                        .to_string(),
                ));
            }
        }

        tracing::info!(
            upload_id = %upload.id,
            import_id = %import.id,
            schema_source = source_name,
            num_columns = resolved.columns.len(),
            "Column mapping saved"
        );

        let import_id = import.id;
        self.events.emit_lossy(PipelineEvent::MaterializationStarted {
            upload_id: upload.id,
            import_id,
            timestamp: Utc::now(),
        });

        self.materializer().launch(MaterializationJob {
            import,
            header_row_index,
            columns: resolved.columns,
        });

        Ok(MaterializationStarted {
            upload_id: upload.id,
            import_id,
            message: "Import triggered".to_string(),
        })
    }
}

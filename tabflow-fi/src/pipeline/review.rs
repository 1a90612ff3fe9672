//! Review, filtered reads and submit

use chrono::Utc;
use tabflow_common::PipelineEvent;
use uuid::Uuid;

use super::ImportPipeline;
use crate::error::{ApiError, ApiResult};
use crate::models::{Import, ImportView, RowsWithheld, SubmittedImport};
use crate::pagination::{ImportData, ImportRowFilter, PageRequest, RowsQuery};
use crate::store::MAX_ALL_ROW_RETRIEVAL;

const NOT_STORED: &str = "Import is not yet stored, please wait...";

impl ImportPipeline {
    async fn authorized_import(&self, upload_id: Uuid, referer: Option<&str>) -> ApiResult<Import> {
        let (upload, _) = self.authorized_upload(upload_id, referer).await?;
        let import = self
            .metadata
            .get_import_by_upload_id(upload.id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Import not found".to_string()))?;

        if let Some(error) = &import.error {
            return Err(ApiError::ImportFailed(error.clone()));
        }
        Ok(import)
    }

    fn stored(import: Import) -> ApiResult<Import> {
        if import.is_stored {
            Ok(import)
        } else {
            Err(ApiError::NotReady(NOT_STORED.to_string()))
        }
    }

    /// Rows a submit may return inline
    pub fn pass_through_ceiling(&self) -> u64 {
        (self.config.pass_through_max_rows as u64).min(MAX_ALL_ROW_RETRIEVAL)
    }

    /// Import summary, plus the first page of rows once stored
    pub async fn review_import(&self, upload_id: Uuid, referer: Option<&str>) -> ApiResult<ImportView> {
        let import = self.authorized_import(upload_id, referer).await?;

        let data = if import.is_stored {
            let page = PageRequest::first(&self.config);
            let rows = self
                .rows
                .paginate_import_rows(import.id, page, ImportRowFilter::All)
                .await?;
            Some(ImportData::new(&import, ImportRowFilter::All, page, rows))
        } else {
            None
        };

        Ok(ImportView {
            has_errors: import.has_errors(),
            import,
            data,
        })
    }

    /// One window of import rows under a filter
    pub async fn import_rows(
        &self,
        upload_id: Uuid,
        query: &RowsQuery,
        referer: Option<&str>,
    ) -> ApiResult<ImportData> {
        let (page, filter) = query.parse(&self.config)?;
        let import = Self::stored(self.authorized_import(upload_id, referer).await?)?;

        let rows = self.rows.paginate_import_rows(import.id, page, filter).await?;
        Ok(ImportData::new(&import, filter, page, rows))
    }

    /// Hand the import back to the integrating application
    ///
    /// Repeat calls return the same result; the completion handler only
    /// runs for the call that first marks the import submitted.
    pub async fn submit_import(
        &self,
        upload_id: Uuid,
        referer: Option<&str>,
    ) -> ApiResult<SubmittedImport> {
        let mut import = Self::stored(self.authorized_import(upload_id, referer).await?)?;

        if import.has_errors() {
            return Err(ApiError::BadRequest(
                "All errors must be resolved before submitting".to_string(),
            ));
        }

        let ceiling = self.pass_through_ceiling();
        let (rows, rows_withheld) = if import.num_rows <= ceiling {
            (self.rows.all_import_rows(import.id, ceiling).await?, None)
        } else {
            let rows_withheld = RowsWithheld {
                num_rows: import.num_rows,
                max_rows: ceiling,
                rows_path: format!("/file-import/v1/import/{}/rows", upload_id),
                message: format!(
                    "The import has {} rows, more than the {} that can be returned at once. Use the rows endpoint to page through them",
                    import.num_rows, ceiling
                ),
            };
            (Vec::new(), Some(rows_withheld))
        };

        let now = Utc::now();
        let newly_submitted = self.metadata.mark_import_submitted(import.id, now).await?;
        if newly_submitted {
            import.submitted_at = Some(now);
        }

        let submitted = SubmittedImport {
            has_errors: import.has_errors(),
            import,
            rows,
            rows_withheld,
        };

        if newly_submitted {
            tracing::info!(
                upload_id = %upload_id,
                import_id = %submitted.import.id,
                rows_inline = submitted.rows_withheld.is_none(),
                "Import submitted"
            );
            self.events.emit_lossy(PipelineEvent::ImportSubmitted {
                upload_id,
                import_id: submitted.import.id,
                rows_inline: submitted.rows_withheld.is_none(),
                timestamp: now,
            });

            if let Some(handler) = &self.complete_handler {
                let handler = handler.clone();
                let payload = submitted.clone();
                tokio::spawn(async move {
                    let import_id = payload.import.id;
                    if let Err(e) = handler.on_import_complete(payload).await {
                        tracing::error!(
                            import_id = %import_id,
                            error = %e,
                            "Import completion handler failed"
                        );
                    }
                });
            }
        }

        Ok(submitted)
    }
}

//! Import materializer
//!
//! Runs detached from the request that claimed it. Reads every raw row below
//! the header in batches, validates it, writes the outcome under the import's
//! id and keeps the import's counters current. Any failure, including a
//! panic in the worker, ends as a terminal error on the import and upload.

use chrono::Utc;
use std::sync::Arc;
use tabflow_common::{Error, EventBus, PipelineEvent, Result};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::validation::RowValidator;
use crate::models::{Import, ImportRow, TemplateColumn};
use crate::store::{MetadataStore, RowStore};

/// Message recorded when a failure has no caller-facing description
const GENERIC_FAILURE: &str = "The import could not be processed";

/// One claimed materialization
#[derive(Debug, Clone)]
pub struct MaterializationJob {
    pub import: Import,
    pub header_row_index: u64,
    /// (raw column index, template column)
    pub columns: Vec<(usize, TemplateColumn)>,
}

#[derive(Clone)]
pub struct Materializer {
    metadata: Arc<dyn MetadataStore>,
    rows: Arc<dyn RowStore>,
    events: EventBus,
    batch_size: u64,
}

impl Materializer {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        rows: Arc<dyn RowStore>,
        events: EventBus,
        batch_size: usize,
    ) -> Self {
        Self {
            metadata,
            rows,
            events,
            batch_size: batch_size.max(1) as u64,
        }
    }

    /// Start the job on a detached task
    ///
    /// The returned handle resolves once the import is stored or failed.
    pub fn launch(self, job: MaterializationJob) -> JoinHandle<()> {
        let import_id = job.import.id;
        let upload_id = job.import.upload_id;

        tracing::info!(
            upload_id = %upload_id,
            import_id = %import_id,
            rows = job.import.num_rows,
            "Launching materialization"
        );

        tokio::spawn(async move {
            let supervisor = self.clone();
            let worker = tokio::spawn(async move { self.run(job).await });

            let failure = match worker.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    tracing::error!(
                        upload_id = %upload_id,
                        import_id = %import_id,
                        error = %e,
                        "Materialization failed"
                    );
                    match e {
                        Error::InvalidInput(msg) => msg,
                        _ => GENERIC_FAILURE.to_string(),
                    }
                }
                Err(join_err) => {
                    tracing::error!(
                        upload_id = %upload_id,
                        import_id = %import_id,
                        error = %join_err,
                        "Materialization task aborted"
                    );
                    GENERIC_FAILURE.to_string()
                }
            };

            supervisor.fail(import_id, upload_id, failure).await;
        })
    }

    async fn fail(&self, import_id: Uuid, upload_id: Uuid, error: String) {
        if let Err(e) = self.metadata.fail_import(import_id, upload_id, &error).await {
            tracing::error!(
                upload_id = %upload_id,
                import_id = %import_id,
                error = %e,
                "Could not record materialization failure"
            );
        }

        self.events.emit_lossy(PipelineEvent::MaterializationFailed {
            upload_id,
            import_id,
            error,
            timestamp: Utc::now(),
        });
    }

    async fn run(&self, job: MaterializationJob) -> Result<()> {
        let mut import = job.import;
        let mut validator = RowValidator::new(&job.columns).map_err(Error::InvalidInput)?;

        let first_row = job.header_row_index + 1;
        let mut next = first_row;

        loop {
            let batch = self
                .rows
                .paginate_upload_rows(import.upload_id, next, self.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            next = last.index + 1;

            let validated: Vec<ImportRow> = batch
                .iter()
                .map(|row| validator.validate(row.index.saturating_sub(first_row), &row.values))
                .collect();

            for row in &validated {
                if row.is_valid() {
                    import.num_valid_rows += 1;
                } else {
                    import.num_error_rows += 1;
                }
            }
            import.num_processed_values += (validated.len() * validator.width()) as u64;

            self.rows.insert_import_rows(import.id, &validated).await?;
            self.metadata.update_import_counters(&import).await?;

            let rows_processed = import.num_valid_rows + import.num_error_rows;
            tracing::debug!(
                import_id = %import.id,
                rows_processed,
                rows_total = import.num_rows,
                "Materialized batch"
            );
            self.events.emit_lossy(PipelineEvent::MaterializationProgress {
                upload_id: import.upload_id,
                import_id: import.id,
                rows_processed,
                rows_total: import.num_rows,
                timestamp: Utc::now(),
            });
        }

        import.num_rows = import.num_valid_rows + import.num_error_rows;
        import.is_stored = true;
        self.metadata.complete_import(&import).await?;

        tracing::info!(
            upload_id = %import.upload_id,
            import_id = %import.id,
            num_rows = import.num_rows,
            num_valid_rows = import.num_valid_rows,
            num_error_rows = import.num_error_rows,
            "Import stored"
        );

        self.events.emit_lossy(PipelineEvent::MaterializationCompleted {
            upload_id: import.upload_id,
            import_id: import.id,
            num_rows: import.num_rows,
            num_valid_rows: import.num_valid_rows,
            num_error_rows: import.num_error_rows,
            timestamp: Utc::now(),
        });

        Ok(())
    }
}

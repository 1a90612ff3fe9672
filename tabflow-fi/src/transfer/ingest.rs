//! Row ingestion once a transfer completes
//!
//! The file is parsed on a blocking thread and batches are streamed to the
//! row store over a bounded channel. On success the upload is marked stored;
//! on failure it carries a terminal error. The transfer file is removed
//! either way.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tabflow_common::PipelineEvent;
use tokio::sync::mpsc;

use super::parser::{self, ParseError, ParseSummary};
use crate::error::{ApiError, ApiResult};
use crate::models::{Upload, UploadRow};
use crate::pipeline::ImportPipeline;

/// Batches buffered between the parser thread and the row store
const CHANNEL_CAPACITY: usize = 4;

/// Parse and store the rows of a completed transfer
pub async fn ingest_upload(pipeline: Arc<ImportPipeline>, upload: Upload, path: PathBuf) {
    let upload_id = upload.id;
    let result = store_rows(&pipeline, &upload, path.clone()).await;

    if let Err(e) = tokio::fs::remove_file(&path).await {
        tracing::warn!(upload_id = %upload_id, error = %e, "Could not remove transfer file");
    }

    let summary = match result {
        Ok(summary) => summary,
        Err(message) => {
            tracing::warn!(upload_id = %upload_id, error = %message, "Upload ingestion failed");
            if let Err(e) = pipeline.metadata().set_upload_error(upload_id, &message).await {
                tracing::error!(upload_id = %upload_id, error = %e, "Could not record upload error");
            }
            return;
        }
    };

    if let Err(e) = finish(&pipeline, &upload, summary).await {
        tracing::error!(upload_id = %upload_id, error = %e, "Could not finalize upload");
        let message = match e {
            ApiError::BadRequest(msg) => msg,
            _ => "The upload could not be processed".to_string(),
        };
        if let Err(e) = pipeline.metadata().set_upload_error(upload_id, &message).await {
            tracing::error!(upload_id = %upload_id, error = %e, "Could not record upload error");
        }
    }
}

/// Returns a caller-facing message on failure
async fn store_rows(
    pipeline: &ImportPipeline,
    upload: &Upload,
    path: PathBuf,
) -> Result<ParseSummary, String> {
    let delimiter = parser::detect_delimiter(upload.file_type.as_deref(), upload.file_name.as_deref())
        .map_err(|e| e.to_string())?;
    let batch_size = pipeline.config().materialize_batch_size;

    let (tx, mut rx) = mpsc::channel::<Vec<UploadRow>>(CHANNEL_CAPACITY);

    let parse = tokio::task::spawn_blocking(move || {
        parser::parse_rows(&path, delimiter, batch_size, |batch| {
            tx.blocking_send(batch).map_err(|_| ParseError::Interrupted)
        })
    });

    let mut write_error = None;
    while let Some(batch) = rx.recv().await {
        if let Err(e) = pipeline.rows().insert_upload_rows(upload.id, &batch).await {
            tracing::error!(upload_id = %upload.id, error = %e, "Could not store upload rows");
            write_error = Some("The upload could not be stored".to_string());
            break;
        }
    }
    // Dropping the receiver stops the parser at its next send
    drop(rx);

    let parsed = parse.await.map_err(|e| {
        tracing::error!(upload_id = %upload.id, error = %e, "Parser task aborted");
        "The file could not be parsed".to_string()
    })?;

    if let Some(message) = write_error {
        return Err(message);
    }

    let summary = parsed.map_err(|e| e.to_string())?;
    if summary.num_rows == 0 {
        return Err("The file does not contain any rows".to_string());
    }

    Ok(summary)
}

async fn finish(pipeline: &ImportPipeline, upload: &Upload, summary: ParseSummary) -> ApiResult<()> {
    pipeline
        .metadata()
        .mark_upload_stored(upload.id, summary.num_rows, summary.num_columns)
        .await?;

    tracing::info!(
        upload_id = %upload.id,
        num_rows = summary.num_rows,
        num_columns = summary.num_columns,
        "Upload stored"
    );
    pipeline.events().emit_lossy(PipelineEvent::UploadStored {
        upload_id: upload.id,
        importer_id: upload.importer_id,
        num_rows: summary.num_rows,
        timestamp: Utc::now(),
    });

    let importer = pipeline
        .metadata()
        .get_importer_without_template(upload.importer_id)
        .await?;

    // A header needs at least one data row beneath it
    if let Some(importer) = importer {
        if importer.skip_header_row_selection && summary.num_rows >= 2 {
            let stored = pipeline
                .metadata()
                .get_upload(upload.id)
                .await?
                .ok_or_else(|| ApiError::NotFound("Upload not found".to_string()))?;
            pipeline.select_header_row(&stored, &importer, 0).await?;
        }
    }

    Ok(())
}

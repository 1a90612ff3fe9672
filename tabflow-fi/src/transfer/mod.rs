//! Resumable upload adapter (tus creation, HEAD and PATCH)
//!
//! Bytes are appended to a file under the uploads directory. The stored
//! offset only advances by a conditional update from the offset the chunk
//! was written at, so a stale or duplicated PATCH is rejected. Reaching the
//! declared length hands the file to row ingestion on a detached task.

pub mod ingest;
pub mod metadata;
pub mod parser;

pub use metadata::UploadMetadata;

use axum::body::Bytes;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::Upload;
use crate::pipeline::{authorize_origin, ImportPipeline};

/// Content type required on PATCH requests
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Transfer creation request
#[derive(Debug, Clone, Default)]
pub struct CreateTransfer {
    pub importer_id: Option<String>,
    pub upload_length: Option<u64>,
    pub metadata: UploadMetadata,
    pub referer: Option<String>,
}

/// Offset and length of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    pub upload_id: Uuid,
    pub tus_id: String,
    pub offset: u64,
    pub length: u64,
}

impl From<&Upload> for TransferStatus {
    fn from(upload: &Upload) -> Self {
        Self {
            upload_id: upload.id,
            tus_id: upload.tus_id.clone(),
            offset: upload.bytes_received,
            length: upload.file_size,
        }
    }
}

/// Removes a transfer from the in-flight set when dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    tus_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.tus_id);
        }
    }
}

pub struct TransferService {
    pipeline: Arc<ImportPipeline>,
    uploads_dir: PathBuf,
    in_flight: Mutex<HashSet<String>>,
}

impl TransferService {
    pub fn new(pipeline: Arc<ImportPipeline>, uploads_dir: PathBuf) -> Self {
        Self {
            pipeline,
            uploads_dir,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn file_path(&self, tus_id: &str) -> PathBuf {
        self.uploads_dir.join(tus_id)
    }

    fn begin_patch(&self, tus_id: &str) -> ApiResult<InFlight<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| ApiError::Internal("Transfer lock poisoned".to_string()))?;
        if !set.insert(tus_id.to_string()) {
            return Err(ApiError::Conflict(
                "Another chunk is being written for this upload".to_string(),
            ));
        }
        Ok(InFlight {
            set: &self.in_flight,
            tus_id: tus_id.to_string(),
        })
    }

    /// Start a transfer for an importer
    pub async fn create(&self, request: CreateTransfer) -> ApiResult<Upload> {
        let importer_id = request
            .importer_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ApiError::BadRequest("No importer ID is present in the request (X-Importer-ID)".to_string())
            })?;
        let importer_id = Uuid::parse_str(importer_id)
            .map_err(|_| ApiError::BadRequest(format!("Invalid importer ID '{}'", importer_id)))?;

        let importer = self
            .pipeline
            .metadata()
            .get_importer_without_template(importer_id)
            .await?
            .ok_or_else(|| ApiError::BadRequest("Importer not found".to_string()))?;

        authorize_origin(&importer, request.referer.as_deref())?;

        let length = request
            .upload_length
            .ok_or_else(|| ApiError::BadRequest("Missing Upload-Length header".to_string()))?;
        let max = self.pipeline.config().max_upload_bytes;
        if length > max {
            return Err(ApiError::PayloadTooLarge(format!(
                "Upload-Length {} exceeds the maximum of {} bytes",
                length, max
            )));
        }

        let mut upload = Upload::new(importer.id, length);
        upload.file_name = request.metadata.file_name;
        upload.file_type = request.metadata.file_type;
        upload.schemaless = request.metadata.schemaless;
        upload.template = request.metadata.template;
        upload.metadata = request.metadata.metadata;

        tokio::fs::create_dir_all(&self.uploads_dir)
            .await
            .map_err(tabflow_common::Error::from)?;
        tokio::fs::File::create(self.file_path(&upload.tus_id))
            .await
            .map_err(tabflow_common::Error::from)?;

        self.pipeline.metadata().create_upload(&upload).await?;

        tracing::info!(
            upload_id = %upload.id,
            importer_id = %importer.id,
            tus_id = %upload.tus_id,
            length,
            file_name = upload.file_name.as_deref().unwrap_or(""),
            "Transfer created"
        );

        if upload.transfer_complete() {
            self.spawn_ingest(upload.clone());
        }

        Ok(upload)
    }

    /// Current offset of a transfer
    pub async fn head(&self, tus_id: &str) -> ApiResult<TransferStatus> {
        let upload = self.load(tus_id).await?;
        Ok(TransferStatus::from(&upload))
    }

    /// Append a chunk at `offset`
    pub async fn patch(
        &self,
        tus_id: &str,
        offset: Option<u64>,
        content_type: Option<&str>,
        chunk: Bytes,
    ) -> ApiResult<TransferStatus> {
        let content_type = content_type.unwrap_or("");
        if !content_type
            .split(';')
            .next()
            .map(|ct| ct.trim().eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
            .unwrap_or(false)
        {
            return Err(ApiError::UnsupportedMediaType(format!(
                "Content-Type must be {}",
                OFFSET_OCTET_STREAM
            )));
        }
        let offset =
            offset.ok_or_else(|| ApiError::BadRequest("Missing Upload-Offset header".to_string()))?;

        let _guard = self.begin_patch(tus_id)?;
        let upload = self.load(tus_id).await?;

        if offset != upload.bytes_received {
            return Err(ApiError::Conflict(format!(
                "Upload-Offset {} does not match the current offset {}",
                offset, upload.bytes_received
            )));
        }
        let new_offset = offset + chunk.len() as u64;
        if new_offset > upload.file_size {
            return Err(ApiError::PayloadTooLarge(format!(
                "Chunk would exceed the declared Upload-Length of {} bytes",
                upload.file_size
            )));
        }

        if !chunk.is_empty() {
            self.write_chunk(tus_id, offset, &chunk)
                .await
                .map_err(tabflow_common::Error::from)?;
        }

        if !self
            .pipeline
            .metadata()
            .advance_upload_offset(upload.id, offset, new_offset)
            .await?
        {
            return Err(ApiError::Conflict(
                "The upload offset changed while the chunk was written".to_string(),
            ));
        }

        tracing::debug!(
            upload_id = %upload.id,
            offset = new_offset,
            length = upload.file_size,
            "Chunk written"
        );

        let mut upload = upload;
        upload.bytes_received = new_offset;
        let status = TransferStatus::from(&upload);

        if upload.transfer_complete() && offset < upload.file_size {
            tracing::info!(upload_id = %upload.id, bytes = upload.file_size, "Transfer complete");
            self.spawn_ingest(upload);
        }

        Ok(status)
    }

    async fn load(&self, tus_id: &str) -> ApiResult<Upload> {
        self.pipeline
            .metadata()
            .get_upload_by_tus_id(tus_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Upload not found".to_string()))
    }

    async fn write_chunk(&self, tus_id: &str, offset: u64, chunk: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.file_path(tus_id))
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(chunk).await?;
        file.flush().await?;
        Ok(())
    }

    fn spawn_ingest(&self, upload: Upload) {
        let path = self.file_path(&upload.tus_id);
        tokio::spawn(ingest::ingest_upload(self.pipeline.clone(), upload, path));
    }
}

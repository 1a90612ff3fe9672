//! Upload models
//!
//! An upload is one resumable transfer plus the row/column structure
//! inferred from it. It is created when the transfer begins and becomes
//! read-only once an import has been claimed for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::template::Template;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Upload {
    pub id: Uuid,
    pub importer_id: Uuid,
    /// Resumable-transfer identifier handed to the client
    pub tus_id: String,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    /// Declared transfer length in bytes
    pub file_size: u64,
    /// Bytes received so far
    pub bytes_received: u64,
    /// Rows extracted from the file, header rows included
    pub num_rows: Option<u64>,
    pub num_columns: Option<u64>,
    pub header_row_index: Option<u64>,
    pub schemaless: bool,
    /// Template supplied with the upload (or synthesized for schemaless uploads)
    pub template: Option<Template>,
    /// Caller metadata copied onto the import
    pub metadata: serde_json::Value,
    /// Raw rows are in the row store
    pub is_stored: bool,
    pub error: Option<String>,
    /// Import claimed for this upload; set at most once
    pub import_id: Option<Uuid>,
    pub upload_columns: Vec<UploadColumn>,
    pub created_at: DateTime<Utc>,
}

impl Upload {
    /// New upload for a transfer that is about to start
    pub fn new(importer_id: Uuid, file_size: u64) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            importer_id,
            tus_id: Uuid::new_v4().simple().to_string(),
            file_name: None,
            file_type: None,
            file_size,
            bytes_received: 0,
            num_rows: None,
            num_columns: None,
            header_row_index: None,
            schemaless: false,
            template: None,
            metadata: serde_json::Value::Null,
            is_stored: false,
            error: None,
            import_id: None,
            upload_columns: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn transfer_complete(&self) -> bool {
        self.bytes_received >= self.file_size
    }

    pub fn column(&self, id: Uuid) -> Option<&UploadColumn> {
        self.upload_columns.iter().find(|c| c.id == id)
    }
}

/// Column derived from the header row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadColumn {
    pub id: Uuid,
    pub upload_id: Uuid,
    /// Position of the column in each raw row
    pub index: usize,
    pub name: String,
    /// Values below the header, for display and schema detection
    pub sample_data: Vec<String>,
    /// Template column whose name or hints match this header
    pub suggested_template_column_id: Option<Uuid>,
    /// Template column assigned by the final mapping
    pub template_column_id: Option<Uuid>,
}

/// Raw row as stored in the row store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadRow {
    pub index: u64,
    pub values: Vec<String>,
}

/// Upload as returned to the client, with a preview of its rows
#[derive(Debug, Clone, Serialize)]
pub struct UploadPreview {
    #[serde(flatten)]
    pub upload: Upload,
    pub upload_rows: Vec<UploadRow>,
}

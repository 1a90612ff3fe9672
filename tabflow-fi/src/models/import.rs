//! Import models
//!
//! An import is the validated result of applying a template to an upload's
//! rows. It is created once per upload when materialization is claimed, its
//! counters only grow while rows are processed, and it is final once
//! `is_stored` is set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::template::{Severity, ValidationType};
use crate::pagination::ImportData;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Import {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub importer_id: Uuid,
    pub num_rows: u64,
    pub num_columns: u64,
    pub num_processed_values: u64,
    pub num_valid_rows: u64,
    pub num_error_rows: u64,
    pub metadata: serde_json::Value,
    pub is_stored: bool,
    /// Terminal materialization error
    pub error: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Import {
    pub fn new(
        upload_id: Uuid,
        importer_id: Uuid,
        num_rows: u64,
        num_columns: u64,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            upload_id,
            importer_id,
            num_rows,
            num_columns,
            num_processed_values: 0,
            num_valid_rows: 0,
            num_error_rows: 0,
            metadata,
            is_stored: false,
            error: None,
            submitted_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.num_error_rows > 0
    }
}

/// Validation failure on a single cell
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellError {
    pub validation_id: Uuid,
    #[serde(rename = "type")]
    pub validation_type: ValidationType,
    pub severity: Severity,
    pub message: String,
}

/// Validated row, keyed by template column key
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImportRow {
    pub index: u64,
    pub values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, Vec<CellError>>,
}

impl ImportRow {
    /// A row is valid unless a cell failed an error-severity rule
    pub fn is_valid(&self) -> bool {
        !self
            .errors
            .values()
            .flatten()
            .any(|e| e.severity == Severity::Error)
    }
}

/// Import summary with the first page of rows (review screen)
///
/// `data` is absent while the import is still being materialized.
#[derive(Debug, Clone, Serialize)]
pub struct ImportView {
    #[serde(flatten)]
    pub import: Import,
    pub has_errors: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ImportData>,
}

/// Result of a successful submit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedImport {
    #[serde(flatten)]
    pub import: Import,
    pub has_errors: bool,
    /// All rows, when the import is small enough to pass through
    pub rows: Vec<ImportRow>,
    /// Present instead of rows when the import is too large to pass through
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_withheld: Option<RowsWithheld>,
}

/// Notice that rows must be read through the paginated API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowsWithheld {
    pub num_rows: u64,
    pub max_rows: u64,
    /// Path of the paginated rows endpoint for this import
    pub rows_path: String,
    pub message: String,
}

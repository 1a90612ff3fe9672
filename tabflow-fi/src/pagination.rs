//! Pagination utilities for tabflow-fi
//!
//! Import rows are read in offset/limit windows under one of three filters.
//! Totals come from the import's stored counters, never from a live count.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tabflow_common::PipelineConfig;

use crate::error::ApiError;
use crate::models::{Import, ImportRow};

/// Offset used when a request does not specify one
pub const DEFAULT_OFFSET: u64 = 0;

/// Row category selected by a read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportRowFilter {
    #[default]
    All,
    Valid,
    Error,
}

impl ImportRowFilter {
    /// Rows in this category, from the import's counters
    pub fn total(&self, import: &Import) -> u64 {
        match self {
            ImportRowFilter::All => import.num_rows,
            ImportRowFilter::Valid => import.num_valid_rows,
            ImportRowFilter::Error => import.num_error_rows,
        }
    }
}

impl FromStr for ImportRowFilter {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "all" => Ok(ImportRowFilter::All),
            "valid" => Ok(ImportRowFilter::Valid),
            "error" => Ok(ImportRowFilter::Error),
            other => Err(ApiError::BadRequest(format!(
                "Invalid filter '{}'. Must be one of: all, valid, error",
                other
            ))),
        }
    }
}

/// Validated row window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u64,
}

impl PageRequest {
    /// Default window (`DEFAULT_OFFSET`, configured default limit)
    pub fn first(config: &PipelineConfig) -> Self {
        Self {
            offset: DEFAULT_OFFSET,
            limit: config.default_page_limit as u64,
        }
    }
}

/// Raw query parameters of a rows request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RowsQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    pub filter: Option<String>,
}

impl RowsQuery {
    /// Validate the query against the configured limits
    ///
    /// Offset must be >= 0 and limit within `1..=max_page_limit`.
    pub fn parse(&self, config: &PipelineConfig) -> Result<(PageRequest, ImportRowFilter), ApiError> {
        let offset = match self.offset {
            None => DEFAULT_OFFSET,
            Some(o) if o >= 0 => o as u64,
            Some(o) => {
                return Err(ApiError::BadRequest(format!(
                    "Offset must be greater than or equal to 0 (got {})",
                    o
                )))
            }
        };

        let max = config.max_page_limit as i64;
        let limit = match self.limit {
            None => config.default_page_limit as u64,
            Some(l) if (1..=max).contains(&l) => l as u64,
            Some(l) => {
                return Err(ApiError::BadRequest(format!(
                    "Limit must be between 1 and {} (got {})",
                    max, l
                )))
            }
        };

        let filter = match &self.filter {
            Some(f) => f.parse()?,
            None => ImportRowFilter::All,
        };

        Ok((PageRequest { offset, limit }, filter))
    }
}

/// Pagination metadata returned with a window of rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Rows matching the filter
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

/// Window of import rows plus its pagination metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportData {
    pub filter: ImportRowFilter,
    pub pagination: Pagination,
    pub rows: Vec<ImportRow>,
}

impl ImportData {
    pub fn new(import: &Import, filter: ImportRowFilter, page: PageRequest, rows: Vec<ImportRow>) -> Self {
        Self {
            filter,
            pagination: Pagination {
                total: filter.total(import),
                offset: page.offset,
                limit: page.limit,
            },
            rows,
        }
    }
}

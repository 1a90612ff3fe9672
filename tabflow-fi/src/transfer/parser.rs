//! Delimited-file row extraction
//!
//! Runs on a blocking thread. Every record becomes a raw row of strings;
//! no header is assumed. Blank records are skipped so row indexes stay
//! contiguous.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

use crate::models::UploadRow;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}")]
    Unsupported(String),

    #[error("The file could not be parsed: {0}")]
    Csv(#[from] csv::Error),

    #[error("The file could not be read: {0}")]
    Io(#[from] std::io::Error),

    /// The receiving side went away
    #[error("Row ingestion was interrupted")]
    Interrupted,
}

/// Field delimiter for a transfer, from its declared type or file name
pub fn detect_delimiter(file_type: Option<&str>, file_name: Option<&str>) -> Result<u8, ParseError> {
    let file_type = file_type.unwrap_or("").to_lowercase();
    let extension = file_name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    if extension == "xlsx"
        || extension == "xls"
        || file_type.contains("spreadsheetml")
        || file_type.contains("ms-excel")
    {
        return Err(ParseError::Unsupported(
            "Excel files are not supported, please upload a CSV or TSV file".to_string(),
        ));
    }

    if extension == "tsv" || file_type.contains("tab-separated-values") {
        Ok(b'\t')
    } else {
        Ok(b',')
    }
}

/// Summary of a completed parse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseSummary {
    pub num_rows: u64,
    pub num_columns: u64,
}

/// Read `path`, handing rows to `sink` in batches of `batch_size`
pub fn parse_rows<F>(
    path: &Path,
    delimiter: u8,
    batch_size: usize,
    mut sink: F,
) -> Result<ParseSummary, ParseError>
where
    F: FnMut(Vec<UploadRow>) -> Result<(), ParseError>,
{
    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(BufReader::new(file));

    let batch_size = batch_size.max(1);
    let mut summary = ParseSummary::default();
    let mut batch = Vec::with_capacity(batch_size);

    for result in reader.byte_records() {
        let record = result?;

        let mut values: Vec<String> = record
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect();

        if summary.num_rows == 0 {
            if let Some(first) = values.first_mut() {
                if let Some(stripped) = first.strip_prefix('\u{feff}') {
                    *first = stripped.to_string();
                }
            }
        }

        if values.iter().all(|v| v.trim().is_empty()) {
            continue;
        }

        summary.num_columns = summary.num_columns.max(values.len() as u64);
        batch.push(UploadRow {
            index: summary.num_rows,
            values,
        });
        summary.num_rows += 1;

        if batch.len() >= batch_size {
            sink(std::mem::replace(&mut batch, Vec::with_capacity(batch_size)))?;
        }
    }

    if !batch.is_empty() {
        sink(batch)?;
    }

    Ok(summary)
}

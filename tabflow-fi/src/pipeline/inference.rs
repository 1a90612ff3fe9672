//! Header-row selection and column derivation

use std::collections::HashSet;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{Template, Upload, UploadColumn, UploadRow};

/// Check a requested header row index against the upload's row count
pub fn validate_header_row_index(upload: &Upload, index: i64) -> Result<u64, ApiError> {
    if index < 0 {
        return Err(ApiError::BadRequest(
            "The header row index must be greater than -1".to_string(),
        ));
    }

    let num_rows = upload.num_rows.ok_or_else(|| {
        ApiError::NotReady("The upload is not yet stored, please wait...".to_string())
    })?;

    let index = index as u64;
    let last_row = num_rows.saturating_sub(1);

    if index > last_row {
        return Err(ApiError::BadRequest(
            "The header row index cannot be greater than the number of rows".to_string(),
        ));
    }
    if index == last_row {
        return Err(ApiError::BadRequest(
            "The header row cannot be set to the last row".to_string(),
        ));
    }

    Ok(index)
}

/// Lowercase alphanumerics only, so "First Name", "first_name" and
/// "FIRST-NAME" compare equal
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Derive upload columns from a window of rows starting at the header row
///
/// Column order follows the header row. Rows below the header supply sample
/// data. When a template is known, each column whose header matches a
/// template column's name, key or suggested mapping is linked to it; a
/// template column is suggested at most once.
pub fn derive_upload_columns(
    upload_id: Uuid,
    window: &[UploadRow],
    template: Option<&Template>,
) -> Vec<UploadColumn> {
    let Some((header, samples)) = window.split_first() else {
        return Vec::new();
    };

    let width = window.iter().map(|r| r.values.len()).max().unwrap_or(0);
    let mut suggested: HashSet<Uuid> = HashSet::new();

    (0..width)
        .map(|index| {
            let raw_name = header.values.get(index).map(|v| v.trim()).unwrap_or("");
            let name = if raw_name.is_empty() {
                format!("Column {}", index + 1)
            } else {
                raw_name.to_string()
            };

            let sample_data = samples
                .iter()
                .map(|row| row.values.get(index).cloned().unwrap_or_default())
                .collect();

            let suggestion = template.and_then(|t| {
                let wanted = normalize(&name);
                if wanted.is_empty() {
                    return None;
                }
                t.columns
                    .iter()
                    .filter(|tc| !suggested.contains(&tc.id))
                    .find(|tc| {
                        normalize(&tc.name) == wanted
                            || normalize(&tc.key) == wanted
                            || tc.suggested_mappings.iter().any(|m| normalize(m) == wanted)
                    })
                    .map(|tc| tc.id)
            });
            if let Some(id) = suggestion {
                suggested.insert(id);
            }

            UploadColumn {
                id: Uuid::new_v4(),
                upload_id,
                index,
                name,
                sample_data,
                suggested_template_column_id: suggestion,
                template_column_id: None,
            }
        })
        .collect()
}

//! tus `Upload-Metadata` decoding
//!
//! The header is a comma-separated list of `key base64(value)` pairs; a key
//! may appear without a value.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;

use crate::error::ApiError;
use crate::models::{Template, TemplateDefinition};

/// Caller-supplied values attached to a transfer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadMetadata {
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub schemaless: bool,
    pub template: Option<Template>,
    /// Arbitrary caller data copied onto the import
    pub metadata: serde_json::Value,
}

fn decode_pairs(header: &str) -> Result<HashMap<String, String>, ApiError> {
    let mut pairs = HashMap::new();

    for entry in header.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(2, ' ');
        let key = parts.next().unwrap_or("").trim();
        if key.is_empty() {
            continue;
        }

        let value = match parts.next().map(str::trim).filter(|v| !v.is_empty()) {
            Some(encoded) => {
                let bytes = STANDARD.decode(encoded).map_err(|_| {
                    ApiError::BadRequest(format!("Upload-Metadata value for '{}' is not valid base64", key))
                })?;
                String::from_utf8(bytes).map_err(|_| {
                    ApiError::BadRequest(format!("Upload-Metadata value for '{}' is not valid UTF-8", key))
                })?
            }
            None => String::new(),
        };

        pairs.insert(key.to_string(), value);
    }

    Ok(pairs)
}

impl UploadMetadata {
    /// Decode the header; an absent header yields empty metadata
    pub fn parse(header: Option<&str>) -> Result<Self, ApiError> {
        let Some(header) = header else {
            return Ok(Self::default());
        };
        let pairs = decode_pairs(header)?;

        let non_empty = |key: &str| pairs.get(key).filter(|v| !v.trim().is_empty()).cloned();

        let schemaless = match pairs.get("schemaless") {
            // a bare key counts as set
            Some(v) if v.is_empty() => true,
            Some(v) => v.trim().parse::<bool>().map_err(|_| {
                ApiError::BadRequest(format!("Invalid schemaless value '{}'", v))
            })?,
            None => false,
        };

        let template = match non_empty("template") {
            Some(raw) if !schemaless => {
                let definition: TemplateDefinition = serde_json::from_str(&raw).map_err(|e| {
                    ApiError::BadRequest(format!("The template could not be read: {}", e))
                })?;
                Some(definition.into_template().map_err(ApiError::BadRequest)?)
            }
            _ => None,
        };

        // Non-JSON metadata is kept as a plain string
        let metadata = non_empty("metadata")
            .map(|raw| serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)))
            .unwrap_or(serde_json::Value::Null);

        Ok(Self {
            file_name: non_empty("filename").or_else(|| non_empty("name")),
            file_type: non_empty("filetype").or_else(|| non_empty("type")),
            schemaless,
            template,
            metadata,
        })
    }
}

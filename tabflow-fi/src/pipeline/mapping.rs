//! Column mapping and schema reconciliation
//!
//! A mapping goes from upload column id to destination: a template column id,
//! or a free-form key for schemaless uploads. The schema it targets is
//! resolved once into a single `Template` before anything is persisted.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{is_valid_key, Template, TemplateColumn, Upload};

/// Where the template for a mapping comes from
#[derive(Debug, Clone)]
pub enum SchemaSource {
    /// Synthesized from the destination keys of the mapping
    Schemaless,
    /// Embedded in the upload by the caller at transfer time
    UploadTemplate(Template),
    /// Stored on the importer; `None` when the importer has no template
    ImporterTemplate(Option<Template>),
}

impl SchemaSource {
    pub fn name(&self) -> &'static str {
        match self {
            SchemaSource::Schemaless => "schemaless",
            SchemaSource::UploadTemplate(_) => "upload",
            SchemaSource::ImporterTemplate(_) => "importer",
        }
    }
}

/// Mapping resolved against a single template
#[derive(Debug, Clone)]
pub struct ResolvedMapping {
    pub template: Template,
    /// Template to persist on the upload (schemaless only)
    pub synthesized: Option<Template>,
    /// Upload column id -> template column id
    pub mapping: HashMap<Uuid, Uuid>,
    /// (raw column index, template column), ordered by raw column index
    pub columns: Vec<(usize, TemplateColumn)>,
}

/// Shape checks that need no stored state
pub fn validate_column_mapping(mapping: &HashMap<String, String>) -> Result<(), ApiError> {
    if mapping.is_empty() {
        return Err(ApiError::BadRequest("No column mapping provided".to_string()));
    }

    for (key, value) in mapping {
        if key.is_empty() {
            return Err(ApiError::BadRequest(
                "The column mapping cannot contain empty keys".to_string(),
            ));
        }
        if value.is_empty() {
            return Err(ApiError::BadRequest(
                "The column mapping cannot contain empty values".to_string(),
            ));
        }
    }

    let mut seen = HashSet::with_capacity(mapping.len());
    if !mapping.values().all(|v| seen.insert(v.as_str())) {
        return Err(ApiError::BadRequest(
            "Destination columns must be unique and not contain duplicate values".to_string(),
        ));
    }

    Ok(())
}

/// Resolve the schema for `upload` and check the mapping against it
pub fn resolve_mapping(
    upload: &Upload,
    source: SchemaSource,
    raw: &HashMap<String, String>,
) -> Result<ResolvedMapping, ApiError> {
    // (upload column index, upload column id, destination), in column order
    let mut entries = Vec::with_capacity(raw.len());
    for (key, destination) in raw {
        let column = Uuid::parse_str(key)
            .ok()
            .and_then(|id| upload.column(id))
            .ok_or_else(|| {
                ApiError::BadRequest(format!("The upload column '{}' does not exist", key))
            })?;
        entries.push((column.index, column.id, destination.as_str()));
    }
    entries.sort_by_key(|(index, _, _)| *index);

    let (template, synthesized, mapping) = match source {
        SchemaSource::Schemaless => {
            let mut columns = Vec::with_capacity(entries.len());
            let mut mapping = HashMap::with_capacity(entries.len());
            for (_, upload_column_id, key) in &entries {
                if !is_valid_key(key) {
                    return Err(ApiError::BadRequest(format!(
                        "The column '{}' is invalid. Destination columns can only contain letters, numbers, and underscores",
                        key
                    )));
                }
                let column = TemplateColumn {
                    id: Uuid::new_v4(),
                    name: key.to_string(),
                    key: key.to_string(),
                    required: false,
                    description: None,
                    validations: Vec::new(),
                    suggested_mappings: Vec::new(),
                };
                mapping.insert(*upload_column_id, column.id);
                columns.push(column);
            }
            let template = Template {
                id: Uuid::new_v4(),
                name: String::new(),
                columns,
            };
            (template.clone(), Some(template), mapping)
        }
        SchemaSource::UploadTemplate(template) | SchemaSource::ImporterTemplate(Some(template)) => {
            if template.columns.is_empty() {
                return Err(ApiError::BadRequest("Template does not have columns".to_string()));
            }
            let mapping = map_to_template(&template, &entries)?;
            (template, None, mapping)
        }
        SchemaSource::ImporterTemplate(None) => {
            return Err(ApiError::BadRequest(
                "Template not attached to importer".to_string(),
            ))
        }
    };

    let provided: HashSet<Uuid> = mapping.values().copied().collect();
    let missing: Vec<&str> = template
        .required_columns()
        .filter(|c| !provided.contains(&c.id))
        .map(|c| c.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "All required columns must be set (missing: {})",
            missing.join(", ")
        )));
    }

    let columns = entries
        .iter()
        .filter_map(|(index, upload_column_id, _)| {
            mapping
                .get(upload_column_id)
                .and_then(|tc| template.column(*tc))
                .map(|tc| (*index, tc.clone()))
        })
        .collect();

    Ok(ResolvedMapping {
        template,
        synthesized,
        mapping,
        columns,
    })
}

fn map_to_template(
    template: &Template,
    entries: &[(usize, Uuid, &str)],
) -> Result<HashMap<Uuid, Uuid>, ApiError> {
    entries
        .iter()
        .map(|(_, upload_column_id, destination)| {
            Uuid::parse_str(destination)
                .ok()
                .and_then(|id| template.column(id))
                .map(|tc| (*upload_column_id, tc.id))
                .ok_or_else(|| {
                    ApiError::BadRequest(format!(
                        "The template column '{}' does not exist",
                        destination
                    ))
                })
        })
        .collect()
}

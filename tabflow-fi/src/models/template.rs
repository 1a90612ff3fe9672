//! Importer and template models
//!
//! A template is the schema uploaded rows are validated against. Templates
//! come from three places: the importer's stored template, a template the
//! caller attaches to an upload (`TemplateDefinition`), or one synthesized
//! from schemaless destination keys.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use uuid::Uuid;

/// Caller-defined importer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Importer {
    pub id: Uuid,
    pub name: String,
    /// Hostname suffixes uploads may originate from; empty means any origin
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub skip_header_row_selection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Template>,
}

/// Ordered set of columns rows are validated against
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: Vec<TemplateColumn>,
}

impl Template {
    /// Empty template, as returned for schemaless importers
    pub fn empty() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            columns: Vec::new(),
        }
    }

    pub fn column(&self, id: Uuid) -> Option<&TemplateColumn> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn required_columns(&self) -> impl Iterator<Item = &TemplateColumn> {
        self.columns.iter().filter(|c| c.required)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateColumn {
    pub id: Uuid,
    pub name: String,
    /// Machine key: letters, digits and underscores only
    pub key: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub validations: Vec<Validation>,
    #[serde(default)]
    pub suggested_mappings: Vec<String>,
}

/// Validation rule attached to a template column
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Validation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub validation_type: ValidationType,
    /// Rule parameter (regex pattern, allowed list); null when unused
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    /// Value must be non-empty
    Filled,
    /// Value must contain a non-whitespace character
    NotBlank,
    /// Value must parse as a number
    Number,
    /// Value must be a recognizable boolean
    Boolean,
    /// Value must match the pattern in `value`
    Regex,
    /// Value must be one of the strings in `value` (case-insensitive)
    List,
    /// Value must not repeat within the column
    Unique,
}

impl ValidationType {
    fn default_message(&self) -> &'static str {
        match self {
            ValidationType::Filled => "This field is required",
            ValidationType::NotBlank => "This field cannot be blank",
            ValidationType::Number => "This field must be a number",
            ValidationType::Boolean => "This field must be true or false",
            ValidationType::Regex => "This field is not in the expected format",
            ValidationType::List => "This field is not one of the allowed values",
            ValidationType::Unique => "This field must be unique",
        }
    }
}

impl FromStr for ValidationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "filled" | "required" => Ok(ValidationType::Filled),
            "not_blank" => Ok(ValidationType::NotBlank),
            "number" => Ok(ValidationType::Number),
            "boolean" => Ok(ValidationType::Boolean),
            "regex" => Ok(ValidationType::Regex),
            "list" => Ok(ValidationType::List),
            "unique" => Ok(ValidationType::Unique),
            other => Err(format!("Unknown validation type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Info,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "error" => Ok(Severity::Error),
            "warning" | "warn" => Ok(Severity::Warning),
            "info" => Ok(Severity::Info),
            other => Err(format!("Unknown validation severity '{}'", other)),
        }
    }
}

/// True if `key` is non-empty and only letters, digits and underscores
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Derive a machine key from a display name ("First Name" -> "first_name")
pub fn key_from_name(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    key.trim_matches('_').to_string()
}

/// Template as supplied by a caller (request body or upload metadata)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TemplateDefinition {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub columns: Vec<TemplateColumnDefinition>,
}

/// Importer as listed in the startup seed file
#[derive(Debug, Clone, Deserialize)]
pub struct ImporterDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub skip_header_row_selection: bool,
    #[serde(default)]
    pub template: Option<TemplateDefinition>,
}

impl ImporterDefinition {
    pub fn into_importer(self) -> Result<Importer, String> {
        let template = self
            .template
            .map(|t| t.into_template())
            .transpose()
            .map_err(|e| format!("Importer '{}': {}", self.name, e))?;

        Ok(Importer {
            id: self.id,
            name: self.name,
            allowed_domains: self.allowed_domains,
            skip_header_row_selection: self.skip_header_row_selection,
            template,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TemplateColumnDefinition {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub validations: Vec<ValidationDefinition>,
    #[serde(default)]
    pub suggested_mappings: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ValidationDefinition {
    #[serde(alias = "type")]
    pub validate: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl TemplateDefinition {
    /// Validate the definition and convert it into a template
    ///
    /// Errors are caller-facing messages.
    pub fn into_template(self) -> Result<Template, String> {
        if self.columns.is_empty() {
            return Err("The template must contain at least one column".to_string());
        }

        let mut keys = HashSet::new();
        let mut columns = Vec::with_capacity(self.columns.len());

        for (n, def) in self.columns.into_iter().enumerate() {
            let name = def.name.trim().to_string();
            if name.is_empty() {
                return Err(format!("Template column {} is missing a name", n + 1));
            }

            let key = match def.key {
                Some(key) if !key.trim().is_empty() => key.trim().to_string(),
                _ => key_from_name(&name),
            };
            if !is_valid_key(&key) {
                return Err(format!(
                    "The key '{}' for column '{}' is invalid. Keys can only contain letters, numbers, and underscores",
                    key, name
                ));
            }
            if !keys.insert(key.clone()) {
                return Err(format!("The key '{}' is used by more than one column", key));
            }

            let validations = def
                .validations
                .into_iter()
                .map(|v| v.into_validation(&name))
                .collect::<Result<Vec<_>, _>>()?;

            columns.push(TemplateColumn {
                id: def.id.unwrap_or_else(Uuid::new_v4),
                name,
                key,
                required: def.required,
                description: def.description.filter(|d| !d.trim().is_empty()),
                validations,
                suggested_mappings: def.suggested_mappings,
            });
        }

        Ok(Template {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name: self.name.unwrap_or_default(),
            columns,
        })
    }
}

impl ValidationDefinition {
    fn into_validation(self, column_name: &str) -> Result<Validation, String> {
        let validation_type: ValidationType = self
            .validate
            .parse()
            .map_err(|e| format!("Column '{}': {}", column_name, e))?;
        let severity: Severity = self
            .severity
            .as_deref()
            .unwrap_or("")
            .parse()
            .map_err(|e| format!("Column '{}': {}", column_name, e))?;

        match validation_type {
            ValidationType::Regex => {
                let pattern = self.value.as_str().ok_or_else(|| {
                    format!("Column '{}': regex validations need a pattern value", column_name)
                })?;
                regex::Regex::new(pattern).map_err(|e| {
                    format!("Column '{}': invalid regex pattern: {}", column_name, e)
                })?;
            }
            ValidationType::List => {
                let is_string_list = self
                    .value
                    .as_array()
                    .map(|items| !items.is_empty() && items.iter().all(|v| v.is_string()))
                    .unwrap_or(false);
                if !is_string_list {
                    return Err(format!(
                        "Column '{}': list validations need a non-empty array of strings",
                        column_name
                    ));
                }
            }
            _ => {}
        }

        let message = self
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| validation_type.default_message().to_string());

        Ok(Validation {
            id: Uuid::new_v4(),
            validation_type,
            value: self.value,
            severity,
            message,
        })
    }
}

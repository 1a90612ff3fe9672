//! Cell validation against template column rules
//!
//! Rules are compiled once per materialization. `filled` and `not_blank`
//! judge emptiness; every other rule passes empty values.

use regex::Regex;
use std::collections::{BTreeMap, HashSet};

use crate::models::{CellError, ImportRow, TemplateColumn, Validation, ValidationType};

enum Check {
    Filled,
    NotBlank,
    Number,
    Boolean,
    Regex(Regex),
    List(HashSet<String>),
    Unique(HashSet<String>),
}

struct CompiledRule {
    rule: Validation,
    check: Check,
}

impl CompiledRule {
    fn compile(rule: &Validation) -> Result<Self, String> {
        let check = match rule.validation_type {
            ValidationType::Filled => Check::Filled,
            ValidationType::NotBlank => Check::NotBlank,
            ValidationType::Number => Check::Number,
            ValidationType::Boolean => Check::Boolean,
            ValidationType::Regex => {
                let pattern = rule
                    .value
                    .as_str()
                    .ok_or_else(|| "Regex validation is missing its pattern".to_string())?;
                Check::Regex(
                    Regex::new(pattern).map_err(|e| format!("Invalid regex '{}': {}", pattern, e))?,
                )
            }
            ValidationType::List => {
                let items = rule
                    .value
                    .as_array()
                    .ok_or_else(|| "List validation is missing its values".to_string())?;
                Check::List(
                    items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(|v| v.trim().to_lowercase())
                        .collect(),
                )
            }
            ValidationType::Unique => Check::Unique(HashSet::new()),
        };

        Ok(Self {
            rule: rule.clone(),
            check,
        })
    }

    /// True if the value passes
    fn apply(&mut self, value: &str) -> bool {
        match &mut self.check {
            Check::Filled => !value.is_empty(),
            Check::NotBlank => !value.trim().is_empty(),
            _ if value.is_empty() => true,
            Check::Number => value.trim().replace(',', "").parse::<f64>().is_ok(),
            Check::Boolean => matches!(
                value.trim().to_lowercase().as_str(),
                "true" | "false" | "yes" | "no" | "y" | "n" | "1" | "0"
            ),
            Check::Regex(re) => re.is_match(value),
            Check::List(allowed) => allowed.contains(&value.trim().to_lowercase()),
            Check::Unique(seen) => seen.insert(value.to_string()),
        }
    }

    fn error(&self) -> CellError {
        CellError {
            validation_id: self.rule.id,
            validation_type: self.rule.validation_type,
            severity: self.rule.severity,
            message: self.rule.message.clone(),
        }
    }
}

struct MappedColumn {
    index: usize,
    key: String,
    rules: Vec<CompiledRule>,
}

/// Validates raw rows for one import
///
/// Holds per-column state (`unique`), so one validator must see every row of
/// the import in order.
pub struct RowValidator {
    columns: Vec<MappedColumn>,
}

impl RowValidator {
    /// Build a validator from (raw column index, template column) pairs
    pub fn new(mapped: &[(usize, TemplateColumn)]) -> Result<Self, String> {
        let mut columns = Vec::with_capacity(mapped.len());
        for (index, column) in mapped {
            let rules = column
                .validations
                .iter()
                .map(CompiledRule::compile)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("Column '{}': {}", column.name, e))?;
            columns.push(MappedColumn {
                index: *index,
                key: column.key.clone(),
                rules,
            });
        }
        Ok(Self { columns })
    }

    /// Number of values produced per row
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Validate one raw row, producing the import row at `index`
    pub fn validate(&mut self, index: u64, raw: &[String]) -> ImportRow {
        let mut values = BTreeMap::new();
        let mut errors = BTreeMap::new();

        for column in &mut self.columns {
            let value = raw
                .get(column.index)
                .map(|v| v.trim_end_matches(['\r', '\n']).to_string())
                .unwrap_or_default();

            let failures: Vec<CellError> = column
                .rules
                .iter_mut()
                .filter_map(|rule| (!rule.apply(&value)).then(|| rule.error()))
                .collect();

            if !failures.is_empty() {
                errors.insert(column.key.clone(), failures);
            }
            values.insert(column.key.clone(), value);
        }

        ImportRow {
            index,
            values,
            errors,
        }
    }
}

//! Data models for tabflow-fi (file import microservice)

pub mod import;
pub mod template;
pub mod upload;

pub use import::{CellError, Import, ImportRow, ImportView, RowsWithheld, SubmittedImport};
pub use template::{
    is_valid_key, Importer, ImporterDefinition, Severity, Template, TemplateColumn, TemplateDefinition, Validation,
    ValidationType,
};
pub use upload::{Upload, UploadColumn, UploadPreview, UploadRow};

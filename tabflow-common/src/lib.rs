//! # Tabflow Common Library
//!
//! Shared code for the tabflow services:
//! - Error and result types
//! - Bootstrap configuration (TOML + root folder resolution)
//! - Pipeline configuration injected into the import controller
//! - Pipeline event bus

pub mod config;
pub mod error;
pub mod events;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use events::{EventBus, PipelineEvent};

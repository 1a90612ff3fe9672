//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration comes from an optional TOML file. Missing or
//! malformed files never stop startup: compiled defaults are used instead
//! and the rejected file is reported through `ConfigSource`.
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable `TABFLOW_ROOT_FOLDER`
//! 3. TOML config file `root_folder`
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ENV_ROOT_FOLDER: &str = "TABFLOW_ROOT_FOLDER";

/// Environment variable pointing at the TOML config file
pub const ENV_CONFIG_FILE: &str = "TABFLOW_CONFIG";

/// Bootstrap configuration loaded from TOML
///
/// Every field has a default so an empty file is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder holding the database and in-flight transfer files
    pub root_folder: Option<PathBuf>,

    /// Address the HTTP server binds to
    pub bind_address: String,

    /// HTTP server port
    pub port: u16,

    /// JSON file of importer definitions upserted at startup
    pub importers_file: Option<PathBuf>,

    /// URL receiving submitted imports (POST, JSON body)
    pub completion_webhook_url: Option<String>,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Pipeline limits and window sizes
    pub pipeline: PipelineConfig,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            bind_address: "127.0.0.1".to_string(),
            port: 5790,
            importers_file: None,
            completion_webhook_url: None,
            logging: LoggingConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Limits and window sizes used by the import pipeline
///
/// Injected into the pipeline controller at construction.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Imports with more rows than this are not returned inline on submit
    pub pass_through_max_rows: usize,

    /// Raw rows returned with an upload preview
    pub preview_rows: usize,

    /// Rows (header included) read when deriving upload columns
    pub column_sample_rows: usize,

    /// Page size when a request does not specify one
    pub default_page_limit: usize,

    /// Largest page a caller may request
    pub max_page_limit: usize,

    /// Rows read and written per materialization batch
    pub materialize_batch_size: usize,

    /// Largest declared transfer length accepted
    pub max_upload_bytes: u64,

    /// Largest single PATCH body accepted
    pub max_chunk_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pass_through_max_rows: 10_000,
            preview_rows: 25,
            column_sample_rows: 10,
            default_page_limit: 100,
            max_page_limit: 1000,
            materialize_batch_size: 500,
            max_upload_bytes: 100 * 1024 * 1024,
            max_chunk_bytes: 32 * 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    /// Reject configurations the pipeline cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.max_page_limit == 0 {
            return Err(Error::Config("pipeline.max_page_limit must be at least 1".to_string()));
        }
        if self.default_page_limit == 0 || self.default_page_limit > self.max_page_limit {
            return Err(Error::Config(format!(
                "pipeline.default_page_limit must be between 1 and {}",
                self.max_page_limit
            )));
        }
        if self.materialize_batch_size == 0 {
            return Err(Error::Config(
                "pipeline.materialize_batch_size must be at least 1".to_string(),
            ));
        }
        if self.column_sample_rows == 0 {
            return Err(Error::Config(
                "pipeline.column_sample_rows must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl TomlConfig {
    /// Parse a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TomlConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.pipeline.validate()?;
        Ok(config)
    }

    /// Load the config file if one resolves, otherwise compiled defaults
    ///
    /// Never fails. The returned source records which case applied so it can
    /// be logged once tracing is up.
    pub fn load_or_default(cli_path: Option<&Path>) -> (Self, ConfigSource) {
        let Some(path) = resolve_config_path(cli_path) else {
            return (Self::default(), ConfigSource::Defaults);
        };

        match Self::load(&path) {
            Ok(config) => (config, ConfigSource::File(path)),
            Err(error) => (Self::default(), ConfigSource::Rejected { path, error }),
        }
    }
}

/// Where the active configuration came from
#[derive(Debug)]
pub enum ConfigSource {
    /// No config file found
    Defaults,
    File(PathBuf),
    /// The file exists but could not be used; defaults are active
    Rejected { path: PathBuf, error: Error },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::Defaults => info!("No config file found, using compiled defaults"),
            ConfigSource::File(path) => info!("Loaded configuration from {}", path.display()),
            ConfigSource::Rejected { path, error } => {
                warn!("Ignoring config file {}: {}", path.display(), error)
            }
        }
    }
}

/// Locate the TOML config file
///
/// CLI argument, then `TABFLOW_CONFIG`, then the per-user config directory,
/// then `/etc/tabflow/config.toml` on Linux.
pub fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(ENV_CONFIG_FILE) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("tabflow").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/tabflow/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Resolves the root folder following the priority order above
#[derive(Debug, Clone, Default)]
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(cli_arg: Option<PathBuf>, toml_value: Option<PathBuf>) -> Self {
        Self { cli_arg, toml_value }
    }

    /// Resolve the root folder; always yields a path
    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ENV_ROOT_FOLDER) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_value {
            return path.clone();
        }

        default_root_folder()
    }
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("tabflow"))
        .unwrap_or_else(|| PathBuf::from("./tabflow_data"))
}

/// Creates the root folder layout and hands out well-known paths
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    /// Create the root folder and the transfer directory if missing
    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        std::fs::create_dir_all(self.uploads_dir())?;
        Ok(())
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    /// SQLite database holding metadata and rows
    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join("tabflow.db")
    }

    /// Directory holding bytes of in-flight transfers
    pub fn uploads_dir(&self) -> PathBuf {
        self.root_folder.join("uploads")
    }
}

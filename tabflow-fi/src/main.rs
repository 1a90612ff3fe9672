//! tabflow-fi - File Import Microservice
//!
//! Accepts resumable tus uploads of CSV/TSV files, lets the end user pick a
//! header row and map columns onto an importer's template, validates every
//! row in the background and serves the result for review and submit.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tabflow_common::config::{RootFolderInitializer, RootFolderResolver, TomlConfig};
use tabflow_common::EventBus;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tabflow_fi::models::ImporterDefinition;
use tabflow_fi::notify::WebhookNotifier;
use tabflow_fi::pipeline::ImportPipeline;
use tabflow_fi::store::{MetadataStore, SqliteMetadataStore, SqliteRowStore};
use tabflow_fi::{AppState, EVENT_BUS_CAPACITY};

/// Command-line arguments for tabflow-fi
#[derive(Parser, Debug)]
#[command(name = "tabflow-fi")]
#[command(about = "File import microservice for tabflow")]
#[command(version)]
struct Args {
    /// Root folder holding the database and in-flight transfers
    #[arg(short, long, env = "TABFLOW_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, env = "TABFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "TABFLOW_PORT")]
    port: Option<u16>,
}

fn init_tracing(config: &TomlConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("tabflow_fi={level},tabflow_common={level},tower_http=info", level = config.logging.level).into()
    });

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    let stderr_layer = file_layer
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Upsert the importer definitions listed in `path`
async fn seed_importers(store: &dyn MetadataStore, path: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read importers file {}", path.display()))?;
    let definitions: Vec<ImporterDefinition> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid importers file {}", path.display()))?;
    let count = definitions.len();

    for definition in definitions {
        let importer = definition.into_importer().map_err(anyhow::Error::msg)?;
        store
            .upsert_importer(&importer)
            .await
            .with_context(|| format!("Failed to store importer {}", importer.id))?;
        info!(
            importer_id = %importer.id,
            name = %importer.name,
            has_template = importer.template.is_some(),
            "Importer loaded"
        );
    }

    info!("Loaded {} importer(s) from {}", count, path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, config_source) = TomlConfig::load_or_default(args.config.as_deref());
    init_tracing(&config)?;

    info!("Starting tabflow-fi (File Import) microservice");
    info!(
        "Version: {} (git {}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );
    config_source.log();

    // Step 1: Resolve root folder
    let resolver = RootFolderResolver::new(args.root_folder.clone(), config.root_folder.clone());
    let root_folder = resolver.resolve();
    info!("Root folder: {}", root_folder.display());

    // Step 2: Create root folder layout if missing
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    // Step 3: Open or create database
    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = tabflow_fi::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;
    info!("Database connection established");

    let metadata = Arc::new(SqliteMetadataStore::new(db_pool.clone()));
    if let Some(path) = &config.importers_file {
        seed_importers(metadata.as_ref(), path).await?;
    }

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let mut pipeline = ImportPipeline::new(
        metadata,
        Arc::new(SqliteRowStore::new(db_pool)),
        Arc::new(config.pipeline.clone()),
        event_bus,
    );

    if let Some(url) = &config.completion_webhook_url {
        pipeline = pipeline.with_complete_handler(Arc::new(WebhookNotifier::new(url.clone())?));
        info!("Completion webhook: {}", url);
    }

    let state = AppState::new(Arc::new(pipeline), initializer.uploads_dir());
    let app = tabflow_fi::build_router(state);

    let port = args.port.unwrap_or(config.port);
    let addr: SocketAddr = format!("{}:{}", config.bind_address, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.bind_address, port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

//! Database access for tabflow-fi
//!
//! One SQLite file holds importer/template/upload/import records and the
//! raw and validated rows. Identifiers and timestamps are stored as TEXT,
//! nested values (templates, row values, cell errors) as JSON TEXT.

pub mod retry;

pub use retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tabflow_common::Result;

/// Initialize database connection pool and create tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::debug!(path = %db_path.display(), "Connecting to database");

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS importers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            allowed_domains TEXT NOT NULL DEFAULT '[]',
            skip_header_row_selection INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS templates (
            id TEXT PRIMARY KEY,
            importer_id TEXT NOT NULL UNIQUE REFERENCES importers(id) ON DELETE CASCADE,
            name TEXT NOT NULL DEFAULT '',
            columns TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uploads (
            id TEXT PRIMARY KEY,
            importer_id TEXT NOT NULL,
            tus_id TEXT NOT NULL UNIQUE,
            file_name TEXT,
            file_type TEXT,
            file_size INTEGER NOT NULL,
            bytes_received INTEGER NOT NULL DEFAULT 0,
            num_rows INTEGER,
            num_columns INTEGER,
            header_row_index INTEGER,
            schemaless INTEGER NOT NULL DEFAULT 0,
            template TEXT,
            metadata TEXT NOT NULL DEFAULT 'null',
            is_stored INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            import_id TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_columns (
            id TEXT PRIMARY KEY,
            upload_id TEXT NOT NULL REFERENCES uploads(id) ON DELETE CASCADE,
            col_index INTEGER NOT NULL,
            name TEXT NOT NULL,
            sample_data TEXT NOT NULL DEFAULT '[]',
            suggested_template_column_id TEXT,
            template_column_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_upload_columns_upload ON upload_columns(upload_id, col_index)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS imports (
            id TEXT PRIMARY KEY,
            upload_id TEXT NOT NULL UNIQUE,
            importer_id TEXT NOT NULL,
            num_rows INTEGER NOT NULL DEFAULT 0,
            num_columns INTEGER NOT NULL DEFAULT 0,
            num_processed_values INTEGER NOT NULL DEFAULT 0,
            num_valid_rows INTEGER NOT NULL DEFAULT 0,
            num_error_rows INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT 'null',
            is_stored INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            submitted_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_rows (
            upload_id TEXT NOT NULL,
            row_index INTEGER NOT NULL,
            row_values TEXT NOT NULL,
            PRIMARY KEY (upload_id, row_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_rows (
            import_id TEXT NOT NULL,
            row_index INTEGER NOT NULL,
            is_valid INTEGER NOT NULL,
            row_values TEXT NOT NULL,
            errors TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (import_id, row_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_import_rows_filter ON import_rows(import_id, is_valid, row_index)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (importers, templates, uploads, imports, rows)");

    Ok(())
}

//! SQLite row store
//!
//! Raw rows are keyed by (upload id, row index), validated rows by
//! (import id, row index). Writes are batched inside one transaction.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tabflow_common::Result;
use uuid::Uuid;

use super::RowStore;
use crate::db::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use crate::models::{CellError, ImportRow, UploadRow};
use crate::pagination::{ImportRowFilter, PageRequest};

#[derive(Clone)]
pub struct SqliteRowStore {
    pool: SqlitePool,
}

impl SqliteRowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn import_row_from_row(row: &SqliteRow) -> Result<ImportRow> {
    let values: String = row.get("row_values");
    let errors: String = row.get("errors");
    Ok(ImportRow {
        index: row.get::<i64, _>("row_index") as u64,
        values: serde_json::from_str::<BTreeMap<String, String>>(&values)?,
        errors: serde_json::from_str::<BTreeMap<String, Vec<CellError>>>(&errors)?,
    })
}

#[async_trait]
impl RowStore for SqliteRowStore {
    async fn insert_upload_rows(&self, upload_id: Uuid, rows: &[UploadRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        // Encode before touching the database
        let upload_id = upload_id.to_string();
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            encoded.push((row.index as i64, serde_json::to_string(&row.values)?));
        }

        retry_on_lock("insert_upload_rows", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            let mut tx = self.pool.begin().await?;
            for (index, values) in &encoded {
                sqlx::query(
                    "INSERT OR REPLACE INTO upload_rows (upload_id, row_index, row_values) VALUES (?, ?, ?)",
                )
                .bind(&upload_id)
                .bind(index)
                .bind(values)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn paginate_upload_rows(
        &self,
        upload_id: Uuid,
        offset: u64,
        count: u64,
    ) -> Result<Vec<UploadRow>> {
        let rows = sqlx::query(
            r#"
            SELECT row_index, row_values FROM upload_rows
            WHERE upload_id = ? AND row_index >= ?
            ORDER BY row_index
            LIMIT ?
            "#,
        )
        .bind(upload_id.to_string())
        .bind(offset as i64)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let values: String = row.get("row_values");
                Ok(UploadRow {
                    index: row.get::<i64, _>("row_index") as u64,
                    values: serde_json::from_str(&values)?,
                })
            })
            .collect()
    }

    async fn insert_import_rows(&self, import_id: Uuid, rows: &[ImportRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let import_id = import_id.to_string();
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            encoded.push((
                row.index as i64,
                row.is_valid(),
                serde_json::to_string(&row.values)?,
                serde_json::to_string(&row.errors)?,
            ));
        }

        retry_on_lock("insert_import_rows", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            let mut tx = self.pool.begin().await?;
            for (index, is_valid, values, errors) in &encoded {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO import_rows (import_id, row_index, is_valid, row_values, errors)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&import_id)
                .bind(index)
                .bind(is_valid)
                .bind(values)
                .bind(errors)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn paginate_import_rows(
        &self,
        import_id: Uuid,
        page: PageRequest,
        filter: ImportRowFilter,
    ) -> Result<Vec<ImportRow>> {
        let query = match filter {
            ImportRowFilter::All => sqlx::query(
                r#"
                SELECT row_index, row_values, errors FROM import_rows
                WHERE import_id = ?
                ORDER BY row_index
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(import_id.to_string()),
            ImportRowFilter::Valid | ImportRowFilter::Error => sqlx::query(
                r#"
                SELECT row_index, row_values, errors FROM import_rows
                WHERE import_id = ? AND is_valid = ?
                ORDER BY row_index
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(import_id.to_string())
            .bind(filter == ImportRowFilter::Valid),
        };

        let rows = query
            .bind(page.limit as i64)
            .bind(page.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(import_row_from_row).collect()
    }

    async fn all_import_rows(&self, import_id: Uuid, max: u64) -> Result<Vec<ImportRow>> {
        let rows = sqlx::query(
            r#"
            SELECT row_index, row_values, errors FROM import_rows
            WHERE import_id = ?
            ORDER BY row_index
            LIMIT ?
            "#,
        )
        .bind(import_id.to_string())
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(import_row_from_row).collect()
    }
}

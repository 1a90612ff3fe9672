//! SQLite metadata store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tabflow_common::{Error, Result};
use uuid::Uuid;

use super::{ClaimOutcome, MaterializationClaim, MetadataStore};
use crate::db::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use crate::models::{Import, Importer, Template, TemplateColumn, Upload, UploadColumn};

#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_upload_columns(&self, upload_id: Uuid) -> Result<Vec<UploadColumn>> {
        let rows = sqlx::query(
            r#"
            SELECT id, upload_id, col_index, name, sample_data,
                   suggested_template_column_id, template_column_id
            FROM upload_columns
            WHERE upload_id = ?
            ORDER BY col_index
            "#,
        )
        .bind(upload_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(upload_column_from_row).collect()
    }

    async fn finish_upload(&self, row: Option<SqliteRow>) -> Result<Option<Upload>> {
        match row {
            Some(row) => {
                let mut upload = upload_from_row(&row)?;
                upload.upload_columns = self.load_upload_columns(upload.id).await?;
                Ok(Some(upload))
            }
            None => Ok(None),
        }
    }
}

const UPLOAD_COLUMNS: &str = r#"
    SELECT id, importer_id, tus_id, file_name, file_type, file_size, bytes_received,
           num_rows, num_columns, header_row_index, schemaless, template, metadata,
           is_stored, error, import_id, created_at
    FROM uploads
"#;

const IMPORT_COLUMNS: &str = r#"
    SELECT id, upload_id, importer_id, num_rows, num_columns, num_processed_values,
           num_valid_rows, num_error_rows, metadata, is_stored, error, submitted_at, created_at
    FROM imports
"#;

fn parse_uuid(value: &str, field: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::Internal(format!("Failed to parse {} '{}': {}", field, value, e)))
}

fn parse_opt_uuid(value: Option<String>, field: &str) -> Result<Option<Uuid>> {
    value.map(|v| parse_uuid(&v, field)).transpose()
}

fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

fn opt_u64(row: &SqliteRow, column: &str) -> Option<u64> {
    row.get::<Option<i64>, _>(column).map(|v| v as u64)
}

fn upload_from_row(row: &SqliteRow) -> Result<Upload> {
    let template: Option<String> = row.get("template");
    let template = template
        .map(|t| serde_json::from_str::<Template>(&t))
        .transpose()?;
    let metadata: String = row.get("metadata");

    Ok(Upload {
        id: parse_uuid(row.get("id"), "upload id")?,
        importer_id: parse_uuid(row.get("importer_id"), "importer id")?,
        tus_id: row.get("tus_id"),
        file_name: row.get("file_name"),
        file_type: row.get("file_type"),
        file_size: row.get::<i64, _>("file_size") as u64,
        bytes_received: row.get::<i64, _>("bytes_received") as u64,
        num_rows: opt_u64(row, "num_rows"),
        num_columns: opt_u64(row, "num_columns"),
        header_row_index: opt_u64(row, "header_row_index"),
        schemaless: row.get("schemaless"),
        template,
        metadata: serde_json::from_str(&metadata)?,
        is_stored: row.get("is_stored"),
        error: row.get("error"),
        import_id: parse_opt_uuid(row.get("import_id"), "import id")?,
        upload_columns: Vec::new(),
        created_at: parse_timestamp(row.get("created_at"), "created_at")?,
    })
}

fn upload_column_from_row(row: &SqliteRow) -> Result<UploadColumn> {
    let sample_data: String = row.get("sample_data");
    Ok(UploadColumn {
        id: parse_uuid(row.get("id"), "upload column id")?,
        upload_id: parse_uuid(row.get("upload_id"), "upload id")?,
        index: row.get::<i64, _>("col_index") as usize,
        name: row.get("name"),
        sample_data: serde_json::from_str(&sample_data)?,
        suggested_template_column_id: parse_opt_uuid(
            row.get("suggested_template_column_id"),
            "suggested template column id",
        )?,
        template_column_id: parse_opt_uuid(row.get("template_column_id"), "template column id")?,
    })
}

fn import_from_row(row: &SqliteRow) -> Result<Import> {
    let metadata: String = row.get("metadata");
    let submitted_at: Option<String> = row.get("submitted_at");

    Ok(Import {
        id: parse_uuid(row.get("id"), "import id")?,
        upload_id: parse_uuid(row.get("upload_id"), "upload id")?,
        importer_id: parse_uuid(row.get("importer_id"), "importer id")?,
        num_rows: row.get::<i64, _>("num_rows") as u64,
        num_columns: row.get::<i64, _>("num_columns") as u64,
        num_processed_values: row.get::<i64, _>("num_processed_values") as u64,
        num_valid_rows: row.get::<i64, _>("num_valid_rows") as u64,
        num_error_rows: row.get::<i64, _>("num_error_rows") as u64,
        metadata: serde_json::from_str(&metadata)?,
        is_stored: row.get("is_stored"),
        error: row.get("error"),
        submitted_at: submitted_at
            .map(|s| parse_timestamp(&s, "submitted_at"))
            .transpose()?,
        created_at: parse_timestamp(row.get("created_at"), "created_at")?,
    })
}

fn importer_from_row(row: &SqliteRow) -> Result<Importer> {
    let allowed_domains: String = row.get("allowed_domains");
    Ok(Importer {
        id: parse_uuid(row.get("id"), "importer id")?,
        name: row.get("name"),
        allowed_domains: serde_json::from_str(&allowed_domains)?,
        skip_header_row_selection: row.get("skip_header_row_selection"),
        template: None,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get_importer(&self, id: Uuid) -> Result<Option<Importer>> {
        let importer = self.get_importer_without_template(id).await?;
        match importer {
            Some(mut importer) => {
                importer.template = self.get_template_by_importer(id).await?;
                Ok(Some(importer))
            }
            None => Ok(None),
        }
    }

    async fn get_importer_without_template(&self, id: Uuid) -> Result<Option<Importer>> {
        let row = sqlx::query(
            "SELECT id, name, allowed_domains, skip_header_row_selection FROM importers WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(importer_from_row).transpose()
    }

    async fn get_template_by_importer(&self, importer_id: Uuid) -> Result<Option<Template>> {
        let row = sqlx::query("SELECT id, name, columns FROM templates WHERE importer_id = ?")
            .bind(importer_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let columns: String = row.get("columns");
                Ok(Some(Template {
                    id: parse_uuid(row.get("id"), "template id")?,
                    name: row.get("name"),
                    columns: serde_json::from_str::<Vec<TemplateColumn>>(&columns)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert_importer(&self, importer: &Importer) -> Result<()> {
        let allowed_domains = serde_json::to_string(&importer.allowed_domains)?;
        let template = importer
            .template
            .as_ref()
            .map(|t| serde_json::to_string(&t.columns).map(|columns| (t, columns)))
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO importers (id, name, allowed_domains, skip_header_row_selection)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                allowed_domains = excluded.allowed_domains,
                skip_header_row_selection = excluded.skip_header_row_selection
            "#,
        )
        .bind(importer.id.to_string())
        .bind(&importer.name)
        .bind(&allowed_domains)
        .bind(importer.skip_header_row_selection)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM templates WHERE importer_id = ?")
            .bind(importer.id.to_string())
            .execute(&mut *tx)
            .await?;

        if let Some((template, columns)) = template {
            sqlx::query("INSERT INTO templates (id, importer_id, name, columns) VALUES (?, ?, ?, ?)")
                .bind(template.id.to_string())
                .bind(importer.id.to_string())
                .bind(&template.name)
                .bind(&columns)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_upload(&self, upload: &Upload) -> Result<()> {
        let template = upload
            .template
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = serde_json::to_string(&upload.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO uploads (
                id, importer_id, tus_id, file_name, file_type, file_size, bytes_received,
                schemaless, template, metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(upload.id.to_string())
        .bind(upload.importer_id.to_string())
        .bind(&upload.tus_id)
        .bind(&upload.file_name)
        .bind(&upload.file_type)
        .bind(upload.file_size as i64)
        .bind(upload.bytes_received as i64)
        .bind(upload.schemaless)
        .bind(&template)
        .bind(&metadata)
        .bind(upload.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_upload(&self, id: Uuid) -> Result<Option<Upload>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", UPLOAD_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        self.finish_upload(row).await
    }

    async fn get_upload_by_tus_id(&self, tus_id: &str) -> Result<Option<Upload>> {
        let row = sqlx::query(&format!("{} WHERE tus_id = ?", UPLOAD_COLUMNS))
            .bind(tus_id)
            .fetch_optional(&self.pool)
            .await?;
        self.finish_upload(row).await
    }

    async fn advance_upload_offset(&self, id: Uuid, expected: u64, new: u64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE uploads SET bytes_received = ? WHERE id = ? AND bytes_received = ?",
        )
        .bind(new as i64)
        .bind(id.to_string())
        .bind(expected as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_upload_stored(&self, id: Uuid, num_rows: u64, num_columns: u64) -> Result<()> {
        let id = id.to_string();
        retry_on_lock("mark_upload_stored", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query(
                "UPDATE uploads SET num_rows = ?, num_columns = ?, is_stored = 1 WHERE id = ?",
            )
            .bind(num_rows as i64)
            .bind(num_columns as i64)
            .bind(&id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn set_upload_error(&self, id: Uuid, error: &str) -> Result<()> {
        let id = id.to_string();
        retry_on_lock("set_upload_error", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query("UPDATE uploads SET error = ? WHERE id = ?")
                .bind(error)
                .bind(&id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn save_header_row(
        &self,
        upload_id: Uuid,
        header_row_index: u64,
        columns: &[UploadColumn],
    ) -> Result<bool> {
        let mut encoded = Vec::with_capacity(columns.len());
        for column in columns {
            encoded.push((column, serde_json::to_string(&column.sample_data)?));
        }

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE uploads SET header_row_index = ? WHERE id = ? AND import_id IS NULL",
        )
        .bind(header_row_index as i64)
        .bind(upload_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM upload_columns WHERE upload_id = ?")
            .bind(upload_id.to_string())
            .execute(&mut *tx)
            .await?;

        for (column, sample_data) in encoded {
            sqlx::query(
                r#"
                INSERT INTO upload_columns (
                    id, upload_id, col_index, name, sample_data,
                    suggested_template_column_id, template_column_id
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(column.id.to_string())
            .bind(upload_id.to_string())
            .bind(column.index as i64)
            .bind(&column.name)
            .bind(&sample_data)
            .bind(column.suggested_template_column_id.map(|id| id.to_string()))
            .bind(column.template_column_id.map(|id| id.to_string()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn import_exists_for_upload(&self, upload_id: Uuid) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM imports WHERE upload_id = ?)")
                .bind(upload_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn claim_materialization(&self, claim: &MaterializationClaim<'_>) -> Result<ClaimOutcome> {
        let import = claim.import;
        let upload_id = import.upload_id.to_string();
        let metadata = serde_json::to_string(&import.metadata)?;
        let template = claim.template.map(serde_json::to_string).transpose()?;
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE uploads SET import_id = ? WHERE id = ? AND import_id IS NULL AND header_row_index = ?",
        )
        .bind(import.id.to_string())
        .bind(&upload_id)
        .bind(claim.header_row_index as i64)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            let current: Option<Option<String>> =
                sqlx::query_scalar("SELECT import_id FROM uploads WHERE id = ?")
                    .bind(&upload_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(match current.flatten() {
                Some(_) => ClaimOutcome::AlreadyClaimed,
                None => ClaimOutcome::HeaderChanged,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO imports (
                id, upload_id, importer_id, num_rows, num_columns, metadata, is_stored, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(import.id.to_string())
        .bind(&upload_id)
        .bind(import.importer_id.to_string())
        .bind(import.num_rows as i64)
        .bind(import.num_columns as i64)
        .bind(&metadata)
        .bind(import.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        if let Some(template) = &template {
            sqlx::query("UPDATE uploads SET template = ? WHERE id = ?")
                .bind(template)
                .bind(&upload_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE upload_columns SET template_column_id = NULL WHERE upload_id = ?")
            .bind(&upload_id)
            .execute(&mut *tx)
            .await?;

        for (upload_column_id, template_column_id) in claim.mapping {
            let mapped = sqlx::query(
                "UPDATE upload_columns SET template_column_id = ? WHERE id = ? AND upload_id = ?",
            )
            .bind(template_column_id.to_string())
            .bind(upload_column_id.to_string())
            .bind(&upload_id)
            .execute(&mut *tx)
            .await?;

            // Same index reselected: the column ids were regenerated
            if mapped.rows_affected() != 1 {
                tx.rollback().await?;
                return Ok(ClaimOutcome::HeaderChanged);
            }
        }

        tx.commit().await?;
        Ok(ClaimOutcome::Claimed)
    }

    async fn get_import(&self, id: Uuid) -> Result<Option<Import>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", IMPORT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(import_from_row).transpose()
    }

    async fn get_import_by_upload_id(&self, upload_id: Uuid) -> Result<Option<Import>> {
        let row = sqlx::query(&format!("{} WHERE upload_id = ?", IMPORT_COLUMNS))
            .bind(upload_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(import_from_row).transpose()
    }

    async fn update_import_counters(&self, import: &Import) -> Result<()> {
        let id = import.id.to_string();
        retry_on_lock("update_import_counters", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query(
                r#"
                UPDATE imports SET
                    num_processed_values = ?, num_valid_rows = ?, num_error_rows = ?
                WHERE id = ?
                "#,
            )
            .bind(import.num_processed_values as i64)
            .bind(import.num_valid_rows as i64)
            .bind(import.num_error_rows as i64)
            .bind(&id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn complete_import(&self, import: &Import) -> Result<()> {
        let id = import.id.to_string();
        retry_on_lock("complete_import", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query(
                r#"
                UPDATE imports SET
                    num_rows = ?, num_processed_values = ?, num_valid_rows = ?,
                    num_error_rows = ?, is_stored = 1
                WHERE id = ?
                "#,
            )
            .bind(import.num_rows as i64)
            .bind(import.num_processed_values as i64)
            .bind(import.num_valid_rows as i64)
            .bind(import.num_error_rows as i64)
            .bind(&id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn fail_import(&self, import_id: Uuid, upload_id: Uuid, error: &str) -> Result<()> {
        let import_id = import_id.to_string();
        let upload_id = upload_id.to_string();
        retry_on_lock("fail_import", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("UPDATE imports SET error = ?, is_stored = 0 WHERE id = ?")
                .bind(error)
                .bind(&import_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE uploads SET error = ? WHERE id = ?")
                .bind(error)
                .bind(&upload_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn mark_import_submitted(&self, import_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result =
            sqlx::query("UPDATE imports SET submitted_at = ? WHERE id = ? AND submitted_at IS NULL")
                .bind(at.to_rfc3339())
                .bind(import_id.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}

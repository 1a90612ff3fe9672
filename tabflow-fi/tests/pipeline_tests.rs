//! Pipeline behavior tests
//!
//! These drive `ImportPipeline` directly against the SQLite stores, staging
//! raw rows without going through a transfer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabflow_common::{EventBus, PipelineConfig};
use tabflow_fi::models::{
    Import, ImportRow, Importer, ImporterDefinition, SubmittedImport, Template, Upload, UploadColumn,
    UploadRow,
};
use tabflow_fi::notify::ImportCompleteHandler;
use tabflow_fi::pagination::{ImportRowFilter, PageRequest, RowsQuery};
use tabflow_fi::pipeline::ImportPipeline;
use tabflow_fi::store::{
    ClaimOutcome, MaterializationClaim, MetadataStore, RowStore, SqliteMetadataStore, SqliteRowStore,
};
use tabflow_fi::ApiError;
use uuid::Uuid;

struct Harness {
    _dir: tempfile::TempDir,
    pipeline: Arc<ImportPipeline>,
    importer: Importer,
}

async fn open_stores() -> (tempfile::TempDir, Arc<SqliteMetadataStore>, Arc<SqliteRowStore>) {
    let dir = tempfile::tempdir().unwrap();
    let pool = tabflow_fi::db::init_database_pool(&dir.path().join("tabflow.db"))
        .await
        .unwrap();
    (
        dir,
        Arc::new(SqliteMetadataStore::new(pool.clone())),
        Arc::new(SqliteRowStore::new(pool)),
    )
}

fn importer_definition() -> ImporterDefinition {
    serde_json::from_value(serde_json::json!({
        "id": Uuid::new_v4(),
        "name": "Products",
        "template": {
            "columns": [
                {"name": "SKU", "required": true, "validations": [{"validate": "unique"}]},
                {"name": "Price", "required": true, "validations": [{"validate": "number"}]},
                {"name": "Notes"}
            ]
        }
    }))
    .unwrap()
}

async fn harness_with(config: PipelineConfig, handler: Option<Arc<dyn ImportCompleteHandler>>) -> Harness {
    let (dir, metadata, rows) = open_stores().await;
    let importer = importer_definition().into_importer().unwrap();
    metadata.upsert_importer(&importer).await.unwrap();

    let mut pipeline = ImportPipeline::new(metadata, rows, Arc::new(config), EventBus::new(64));
    if let Some(handler) = handler {
        pipeline = pipeline.with_complete_handler(handler);
    }

    Harness {
        _dir: dir,
        pipeline: Arc::new(pipeline),
        importer,
    }
}

async fn harness() -> Harness {
    harness_with(PipelineConfig::default(), None).await
}

/// Store `records` as the raw rows of a new upload
async fn stage_upload(h: &Harness, records: &[&[&str]], schemaless: bool) -> Upload {
    let mut upload = Upload::new(h.importer.id, 0);
    upload.schemaless = schemaless;
    h.pipeline.metadata().create_upload(&upload).await.unwrap();

    let rows: Vec<UploadRow> = records
        .iter()
        .enumerate()
        .map(|(i, r)| UploadRow {
            index: i as u64,
            values: r.iter().map(|v| v.to_string()).collect(),
        })
        .collect();
    h.pipeline.rows().insert_upload_rows(upload.id, &rows).await.unwrap();

    let width = records.iter().map(|r| r.len()).max().unwrap_or(0) as u64;
    h.pipeline
        .metadata()
        .mark_upload_stored(upload.id, rows.len() as u64, width)
        .await
        .unwrap();

    h.pipeline.metadata().get_upload(upload.id).await.unwrap().unwrap()
}

fn product_rows(count: usize, bad_prices: &[usize]) -> Vec<Vec<String>> {
    let mut rows = vec![vec!["SKU".to_string(), "Price".to_string(), "Notes".to_string()]];
    for i in 0..count {
        let price = if bad_prices.contains(&i) {
            "n/a".to_string()
        } else {
            format!("{}.99", i)
        };
        rows.push(vec![format!("SKU-{}", i), price, String::new()]);
    }
    rows
}

async fn stage_products(h: &Harness, count: usize, bad_prices: &[usize]) -> Upload {
    let rows = product_rows(count, bad_prices);
    let refs: Vec<Vec<&str>> = rows.iter().map(|r| r.iter().map(String::as_str).collect()).collect();
    let slices: Vec<&[&str]> = refs.iter().map(Vec::as_slice).collect();
    stage_upload(h, &slices, false).await
}

/// Map every suggested column
fn suggested_mapping(upload: &Upload) -> HashMap<String, String> {
    upload
        .upload_columns
        .iter()
        .filter_map(|c| {
            c.suggested_template_column_id
                .map(|t| (c.id.to_string(), t.to_string()))
        })
        .collect()
}

async fn wait_until_stored(h: &Harness, upload_id: Uuid) -> Import {
    for _ in 0..400 {
        if let Some(import) = h.pipeline.metadata().get_import_by_upload_id(upload_id).await.unwrap() {
            if import.is_stored || import.error.is_some() {
                return import;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("Import for upload {} never finished", upload_id);
}

async fn materialize(h: &Harness, upload: &Upload) -> Import {
    let upload = h.pipeline.set_header_row(upload.id, Some(0), None).await.unwrap();
    h.pipeline
        .set_column_mapping(upload.id, suggested_mapping(&upload), None)
        .await
        .unwrap();
    wait_until_stored(h, upload.id).await
}

#[tokio::test]
async fn test_header_row_index_bounds_for_every_index() {
    let h = harness().await;
    let upload = stage_products(&h, 4, &[]).await;
    let num_rows = upload.num_rows.unwrap() as i64;
    assert_eq!(num_rows, 5);

    for index in -2..num_rows + 3 {
        let result = h.pipeline.set_header_row(upload.id, Some(index), None).await;
        if (0..num_rows - 1).contains(&index) {
            let upload = result.unwrap();
            assert_eq!(upload.header_row_index, Some(index as u64));
        } else {
            assert!(matches!(result, Err(ApiError::BadRequest(_))), "index {}", index);
        }
    }
}

#[tokio::test]
async fn test_header_row_on_unstored_upload_is_not_ready() {
    let h = harness().await;
    let upload = Upload::new(h.importer.id, 100);
    h.pipeline.metadata().create_upload(&upload).await.unwrap();

    let result = h.pipeline.set_header_row(upload.id, Some(0), None).await;
    assert!(matches!(result, Err(ApiError::NotReady(_))));
}

#[tokio::test]
async fn test_reselection_discards_columns_until_import_exists() {
    let h = harness().await;
    let upload = stage_products(&h, 4, &[]).await;

    let first = h.pipeline.set_header_row(upload.id, Some(0), None).await.unwrap();
    let second = h.pipeline.set_header_row(upload.id, Some(1), None).await.unwrap();
    assert_eq!(second.upload_columns.len(), 3);
    let first_ids: Vec<Uuid> = first.upload_columns.iter().map(|c| c.id).collect();
    assert!(second.upload_columns.iter().all(|c| !first_ids.contains(&c.id)));

    let upload = h.pipeline.set_header_row(upload.id, Some(0), None).await.unwrap();
    h.pipeline
        .set_column_mapping(upload.id, suggested_mapping(&upload), None)
        .await
        .unwrap();

    let result = h.pipeline.set_header_row(upload.id, Some(1), None).await;
    assert!(matches!(result, Err(ApiError::BadRequest(_))));
}

#[tokio::test]
async fn test_mapping_requires_header_row() {
    let h = harness().await;
    let upload = stage_products(&h, 2, &[]).await;

    let mut mapping = HashMap::new();
    mapping.insert(Uuid::new_v4().to_string(), Uuid::new_v4().to_string());
    let result = h.pipeline.set_column_mapping(upload.id, mapping, None).await;
    match result {
        Err(ApiError::BadRequest(msg)) => assert_eq!(msg, "The header row has not been set"),
        other => panic!("unexpected result: {:?}", other.map(|s| s.message)),
    }
}

#[tokio::test]
async fn test_concurrent_mappings_launch_once() {
    let h = harness().await;
    let upload = stage_products(&h, 20, &[]).await;
    let upload = h.pipeline.set_header_row(upload.id, Some(0), None).await.unwrap();
    let mapping = suggested_mapping(&upload);

    let (a, b) = tokio::join!(
        h.pipeline.set_column_mapping(upload.id, mapping.clone(), None),
        h.pipeline.set_column_mapping(upload.id, mapping.clone(), None),
    );

    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!([a, b]
        .into_iter()
        .any(|r| matches!(r, Err(ApiError::Conflict(_)))));

    let import = wait_until_stored(&h, upload.id).await;
    assert_eq!(import.num_rows, 20);
    assert_eq!(import.num_valid_rows, 20);
}

#[tokio::test]
async fn test_schemaless_template_has_one_column_per_key() {
    let h = harness().await;
    let upload = stage_upload(
        &h,
        &[&["a", "b", "c"], &["1", "2", "3"], &["4", "5", "6"]],
        true,
    )
    .await;
    let upload = h.pipeline.set_header_row(upload.id, Some(0), None).await.unwrap();

    for bad in ["first name", "first-name"] {
        let mut mapping = HashMap::new();
        mapping.insert(upload.upload_columns[0].id.to_string(), bad.to_string());
        let result = h.pipeline.set_column_mapping(upload.id, mapping, None).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))), "{}", bad);
    }

    let mapping: HashMap<String, String> = upload
        .upload_columns
        .iter()
        .zip(["alpha", "beta_2", "Gamma"])
        .map(|(c, key)| (c.id.to_string(), key.to_string()))
        .collect();
    h.pipeline.set_column_mapping(upload.id, mapping, None).await.unwrap();

    let stored = h.pipeline.metadata().get_upload(upload.id).await.unwrap().unwrap();
    let template = stored.template.unwrap();
    assert_eq!(template.columns.len(), 3);
    let mut keys: Vec<&str> = template.columns.iter().map(|c| c.key.as_str()).collect();
    keys.sort();
    assert_eq!(keys, vec!["Gamma", "alpha", "beta_2"]);
    assert!(stored
        .upload_columns
        .iter()
        .all(|c| c.template_column_id.is_some_and(|id| template.column(id).is_some())));

    let import = wait_until_stored(&h, upload.id).await;
    assert_eq!(import.num_valid_rows, 2);
}

#[tokio::test]
async fn test_optional_columns_may_be_left_unmapped() {
    let h = harness().await;
    let upload = stage_products(&h, 3, &[]).await;
    let upload = h.pipeline.set_header_row(upload.id, Some(0), None).await.unwrap();
    let template = h.importer.template.as_ref().unwrap();

    let mut mapping = HashMap::new();
    mapping.insert(upload.upload_columns[0].id.to_string(), template.columns[0].id.to_string());
    mapping.insert(upload.upload_columns[1].id.to_string(), template.columns[1].id.to_string());

    let started = h.pipeline.set_column_mapping(upload.id, mapping, None).await.unwrap();
    assert_eq!(started.message, "Import triggered");

    let import = wait_until_stored(&h, upload.id).await;
    assert_eq!(import.num_columns, 2);
    assert_eq!(import.num_processed_values, 6);
}

#[tokio::test]
async fn test_rows_not_ready_before_materialization() {
    let h = harness().await;
    let upload = stage_products(&h, 3, &[]).await;
    h.pipeline.set_header_row(upload.id, Some(0), None).await.unwrap();

    // Claim an import without launching it
    let import = Import::new(upload.id, h.importer.id, 3, 3, serde_json::Value::Null);
    let mapping = HashMap::new();
    let outcome = h
        .pipeline
        .metadata()
        .claim_materialization(&MaterializationClaim {
            import: &import,
            header_row_index: 0,
            template: None,
            mapping: &mapping,
        })
        .await
        .unwrap();
    assert_eq!(outcome, ClaimOutcome::Claimed);

    let result = h.pipeline.import_rows(upload.id, &RowsQuery::default(), None).await;
    assert!(matches!(result, Err(ApiError::NotReady(_))));

    let result = h.pipeline.submit_import(upload.id, None).await;
    assert!(matches!(result, Err(ApiError::NotReady(_))));

    let view = h.pipeline.review_import(upload.id, None).await.unwrap();
    assert!(!view.import.is_stored);
    assert!(view.data.is_none());
}

#[tokio::test]
async fn test_pagination_windows_match_totals() {
    let h = harness().await;
    let upload = stage_products(&h, 12, &[1, 5, 6, 11]).await;
    let import = materialize(&h, &upload).await;

    assert_eq!(import.num_rows, 12);
    assert_eq!(import.num_valid_rows + import.num_error_rows, 12);
    assert_eq!(import.num_error_rows, 4);

    for limit in [1_i64, 5, 12, 50] {
        let query = RowsQuery {
            offset: Some(0),
            limit: Some(limit),
            filter: None,
        };
        let data = h.pipeline.import_rows(upload.id, &query, None).await.unwrap();
        assert_eq!(data.rows.len() as i64, limit.min(12));
        assert_eq!(data.pagination.total, 12);
    }

    let errors = h
        .pipeline
        .rows()
        .paginate_import_rows(import.id, PageRequest { offset: 0, limit: 5 }, ImportRowFilter::Error)
        .await
        .unwrap();
    assert_eq!(errors.len() as u64, import.num_error_rows);
    let indices: Vec<u64> = errors.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1, 5, 6, 11]);

    let valid = h
        .pipeline
        .rows()
        .paginate_import_rows(import.id, PageRequest { offset: 6, limit: 5 }, ImportRowFilter::Valid)
        .await
        .unwrap();
    let indices: Vec<u64> = valid.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![9, 10]);
}

#[tokio::test]
async fn test_duplicate_values_flagged_by_unique_rule() {
    let h = harness().await;
    let upload = stage_upload(
        &h,
        &[
            &["SKU", "Price"],
            &["A-1", "1"],
            &["A-2", "2"],
            &["A-1", "3"],
        ],
        false,
    )
    .await;
    let import = materialize(&h, &upload).await;

    assert_eq!(import.num_error_rows, 1);
    let rows: Vec<ImportRow> = h.pipeline.rows().all_import_rows(import.id, 10).await.unwrap();
    assert!(rows[0].is_valid());
    assert!(!rows[2].is_valid());
    assert!(rows[2].errors.contains_key("sku"));
}

struct CountingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl ImportCompleteHandler for CountingHandler {
    async fn on_import_complete(&self, import: SubmittedImport) -> anyhow::Result<()> {
        assert!(import.import.submitted_at.is_some());
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_submit_is_idempotent_and_notifies_once() {
    let handler = Arc::new(CountingHandler {
        calls: AtomicUsize::new(0),
    });
    let h = harness_with(PipelineConfig::default(), Some(handler.clone())).await;
    let upload = stage_products(&h, 6, &[]).await;
    materialize(&h, &upload).await;

    let first = h.pipeline.submit_import(upload.id, None).await.unwrap();
    let second = h.pipeline.submit_import(upload.id, None).await.unwrap();
    assert_eq!(first.rows.len(), 6);
    assert_eq!(first.rows, second.rows);
    assert!(first.rows_withheld.is_none());

    for _ in 0..40 {
        if handler.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_submit_rejects_errors_and_withholds_large_imports() {
    let h = harness_with(
        PipelineConfig {
            pass_through_max_rows: 4,
            ..PipelineConfig::default()
        },
        None,
    )
    .await;

    let with_errors = stage_products(&h, 3, &[0]).await;
    materialize(&h, &with_errors).await;
    let result = h.pipeline.submit_import(with_errors.id, None).await;
    assert!(matches!(result, Err(ApiError::BadRequest(_))));

    let at_ceiling = stage_products(&h, 4, &[]).await;
    materialize(&h, &at_ceiling).await;
    let submitted = h.pipeline.submit_import(at_ceiling.id, None).await.unwrap();
    assert_eq!(submitted.rows.len(), 4);
    assert!(submitted.rows_withheld.is_none());

    let above = stage_products(&h, 5, &[]).await;
    materialize(&h, &above).await;
    let submitted = h.pipeline.submit_import(above.id, None).await.unwrap();
    assert!(submitted.rows.is_empty());
    let withheld = submitted.rows_withheld.unwrap();
    assert_eq!(withheld.num_rows, 5);
    assert_eq!(withheld.max_rows, 4);
}

/// Row store whose import-row writes always fail
struct BrokenImportRows {
    inner: Arc<dyn RowStore>,
}

#[async_trait]
impl RowStore for BrokenImportRows {
    async fn insert_upload_rows(&self, upload_id: Uuid, rows: &[UploadRow]) -> tabflow_common::Result<()> {
        self.inner.insert_upload_rows(upload_id, rows).await
    }

    async fn paginate_upload_rows(
        &self,
        upload_id: Uuid,
        offset: u64,
        count: u64,
    ) -> tabflow_common::Result<Vec<UploadRow>> {
        self.inner.paginate_upload_rows(upload_id, offset, count).await
    }

    async fn insert_import_rows(&self, _import_id: Uuid, _rows: &[ImportRow]) -> tabflow_common::Result<()> {
        Err(tabflow_common::Error::Internal("disk full".to_string()))
    }

    async fn paginate_import_rows(
        &self,
        import_id: Uuid,
        page: PageRequest,
        filter: ImportRowFilter,
    ) -> tabflow_common::Result<Vec<ImportRow>> {
        self.inner.paginate_import_rows(import_id, page, filter).await
    }

    async fn all_import_rows(&self, import_id: Uuid, max: u64) -> tabflow_common::Result<Vec<ImportRow>> {
        self.inner.all_import_rows(import_id, max).await
    }
}

#[tokio::test]
async fn test_failed_materialization_is_terminal() {
    let base = harness().await;
    let broken = BrokenImportRows {
        inner: base.pipeline.rows().clone(),
    };
    let pipeline = ImportPipeline::new(
        base.pipeline.metadata().clone(),
        Arc::new(broken),
        Arc::new(PipelineConfig::default()),
        EventBus::new(8),
    );
    let h = Harness {
        _dir: base._dir,
        pipeline: Arc::new(pipeline),
        importer: base.importer,
    };

    let upload = stage_products(&h, 3, &[]).await;
    let import = materialize(&h, &upload).await;
    assert!(!import.is_stored);
    assert_eq!(import.error.as_deref(), Some("The import could not be processed"));

    let upload = h.pipeline.metadata().get_upload(upload.id).await.unwrap().unwrap();
    assert!(upload.error.is_some());

    let result = h.pipeline.review_import(upload.id, None).await;
    assert!(matches!(result, Err(ApiError::ImportFailed(_))));
}

/// Moves the header row to `row_index` right before every claim
struct ReselectBeforeClaim {
    inner: Arc<dyn MetadataStore>,
    row_index: u64,
}

#[async_trait]
impl MetadataStore for ReselectBeforeClaim {
    async fn get_importer(&self, id: Uuid) -> tabflow_common::Result<Option<Importer>> {
        self.inner.get_importer(id).await
    }

    async fn get_importer_without_template(&self, id: Uuid) -> tabflow_common::Result<Option<Importer>> {
        self.inner.get_importer_without_template(id).await
    }

    async fn get_template_by_importer(&self, importer_id: Uuid) -> tabflow_common::Result<Option<Template>> {
        self.inner.get_template_by_importer(importer_id).await
    }

    async fn upsert_importer(&self, importer: &Importer) -> tabflow_common::Result<()> {
        self.inner.upsert_importer(importer).await
    }

    async fn create_upload(&self, upload: &Upload) -> tabflow_common::Result<()> {
        self.inner.create_upload(upload).await
    }

    async fn get_upload(&self, id: Uuid) -> tabflow_common::Result<Option<Upload>> {
        self.inner.get_upload(id).await
    }

    async fn get_upload_by_tus_id(&self, tus_id: &str) -> tabflow_common::Result<Option<Upload>> {
        self.inner.get_upload_by_tus_id(tus_id).await
    }

    async fn advance_upload_offset(&self, id: Uuid, expected: u64, new: u64) -> tabflow_common::Result<bool> {
        self.inner.advance_upload_offset(id, expected, new).await
    }

    async fn mark_upload_stored(&self, id: Uuid, num_rows: u64, num_columns: u64) -> tabflow_common::Result<()> {
        self.inner.mark_upload_stored(id, num_rows, num_columns).await
    }

    async fn set_upload_error(&self, id: Uuid, error: &str) -> tabflow_common::Result<()> {
        self.inner.set_upload_error(id, error).await
    }

    async fn save_header_row(
        &self,
        upload_id: Uuid,
        header_row_index: u64,
        columns: &[UploadColumn],
    ) -> tabflow_common::Result<bool> {
        self.inner.save_header_row(upload_id, header_row_index, columns).await
    }

    async fn import_exists_for_upload(&self, upload_id: Uuid) -> tabflow_common::Result<bool> {
        self.inner.import_exists_for_upload(upload_id).await
    }

    async fn claim_materialization(&self, claim: &MaterializationClaim<'_>) -> tabflow_common::Result<ClaimOutcome> {
        let upload_id = claim.import.upload_id;
        let columns: Vec<UploadColumn> = (0..3)
            .map(|index| UploadColumn {
                id: Uuid::new_v4(),
                upload_id,
                index,
                name: "junk".to_string(),
                sample_data: Vec::new(),
                suggested_template_column_id: None,
                template_column_id: None,
            })
            .collect();
        assert!(self.inner.save_header_row(upload_id, self.row_index, &columns).await?);
        self.inner.claim_materialization(claim).await
    }

    async fn get_import(&self, id: Uuid) -> tabflow_common::Result<Option<Import>> {
        self.inner.get_import(id).await
    }

    async fn get_import_by_upload_id(&self, upload_id: Uuid) -> tabflow_common::Result<Option<Import>> {
        self.inner.get_import_by_upload_id(upload_id).await
    }

    async fn update_import_counters(&self, import: &Import) -> tabflow_common::Result<()> {
        self.inner.update_import_counters(import).await
    }

    async fn complete_import(&self, import: &Import) -> tabflow_common::Result<()> {
        self.inner.complete_import(import).await
    }

    async fn fail_import(&self, import_id: Uuid, upload_id: Uuid, error: &str) -> tabflow_common::Result<()> {
        self.inner.fail_import(import_id, upload_id, error).await
    }

    async fn mark_import_submitted(&self, import_id: Uuid, at: DateTime<Utc>) -> tabflow_common::Result<bool> {
        self.inner.mark_import_submitted(import_id, at).await
    }
}

#[tokio::test]
async fn test_header_reselected_during_mapping_is_rejected() {
    let base = harness().await;
    let reselect = ReselectBeforeClaim {
        inner: base.pipeline.metadata().clone(),
        row_index: 1,
    };
    let pipeline = ImportPipeline::new(
        Arc::new(reselect),
        base.pipeline.rows().clone(),
        Arc::new(PipelineConfig::default()),
        EventBus::new(8),
    );
    let h = Harness {
        _dir: base._dir,
        pipeline: Arc::new(pipeline),
        importer: base.importer,
    };

    let upload = stage_products(&h, 3, &[]).await;
    let upload = h.pipeline.set_header_row(upload.id, Some(0), None).await.unwrap();

    let result = h
        .pipeline
        .set_column_mapping(upload.id, suggested_mapping(&upload), None)
        .await;
    assert!(matches!(result, Err(ApiError::Conflict(_))), "{:?}", result.map(|s| s.import_id));

    let upload = h.pipeline.metadata().get_upload(upload.id).await.unwrap().unwrap();
    assert_eq!(upload.header_row_index, Some(1));
    assert_eq!(upload.import_id, None);
    assert!(upload.upload_columns.iter().all(|c| c.template_column_id.is_none()));
    assert!(h
        .pipeline
        .metadata()
        .get_import_by_upload_id(upload.id)
        .await
        .unwrap()
        .is_none());
}

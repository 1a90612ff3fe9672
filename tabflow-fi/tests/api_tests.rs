//! Integration tests for the tabflow-fi HTTP API
//!
//! Each test drives the full router against a fresh SQLite file in a
//! temporary root folder.

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::time::Duration;
use tabflow_common::{PipelineConfig, PipelineEvent};
use tabflow_fi::models::ImporterDefinition;
use tabflow_fi::{build_router, AppState};
use tower::util::ServiceExt;
use uuid::Uuid;

const REFERER: &str = "https://app.example.com/import";

struct TestApp {
    _dir: tempfile::TempDir,
    app: Router,
    state: AppState,
}

async fn create_test_app(config: PipelineConfig) -> TestApp {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = tabflow_fi::db::init_database_pool(&dir.path().join("tabflow.db"))
        .await
        .expect("Failed to open database");

    let state = AppState::from_pool(pool, config, dir.path().join("uploads"));
    let app = build_router(state.clone());

    TestApp { _dir: dir, app, state }
}

/// Store an importer and return it with its template
async fn seed_importer(test: &TestApp, definition: Value) -> tabflow_fi::models::Importer {
    let definition: ImporterDefinition = serde_json::from_value(definition).unwrap();
    let importer = definition.into_importer().unwrap();
    test.state
        .pipeline
        .metadata()
        .upsert_importer(&importer)
        .await
        .unwrap();
    importer
}

fn contacts_importer() -> Value {
    json!({
        "id": Uuid::new_v4(),
        "name": "Contacts",
        "allowed_domains": ["example.com"],
        "template": {
            "name": "Contacts",
            "columns": [
                {"name": "Name", "required": true,
                 "validations": [{"validate": "filled", "message": "Name is required"}]},
                {"name": "Email", "required": true,
                 "validations": [{"validate": "regex", "value": "^[^@\\s]+@[^@\\s]+$"}]},
                {"name": "Phone"}
            ]
        }
    })
}

/// Request builder carrying an allowed Referer
fn request(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::REFERER, REFERER)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, headers, json)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let req = request(Method::GET, uri).body(Body::empty()).unwrap();
    let (status, _, body) = send(app, req).await;
    (status, body)
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = request(Method::POST, uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, _, body) = send(app, req).await;
    (status, body)
}

/// Poll `uri` until `ready` accepts a 200 response
async fn poll(app: &Router, uri: &str, ready: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..400 {
        let (status, body) = get(app, uri).await;
        if status == StatusCode::OK && ready(&body) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("Timed out waiting for {}", uri);
}

fn metadata_header(pairs: &[(&str, Option<&str>)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| match v {
            Some(v) => format!("{} {}", k, STANDARD.encode(v)),
            None => k.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

async fn create_transfer(app: &Router, importer_id: Uuid, length: usize, metadata: &str) -> (StatusCode, HeaderMap, Value) {
    let req = request(Method::POST, "/file-import/v1/files")
        .header("x-importer-id", importer_id.to_string())
        .header("upload-length", length.to_string())
        .header("upload-metadata", metadata)
        .header("tus-resumable", "1.0.0")
        .body(Body::empty())
        .unwrap();
    send(app, req).await
}

async fn patch_chunk(app: &Router, tus_id: &str, offset: usize, chunk: &[u8]) -> (StatusCode, HeaderMap, Value) {
    let req = request(Method::PATCH, &format!("/file-import/v1/files/{}", tus_id))
        .header("upload-offset", offset.to_string())
        .header(header::CONTENT_TYPE, "application/offset+octet-stream")
        .header("tus-resumable", "1.0.0")
        .body(Body::from(chunk.to_vec()))
        .unwrap();
    send(app, req).await
}

/// Upload `csv` in one chunk and wait until its rows are stored
async fn upload_stored(app: &Router, importer_id: Uuid, csv: &str, metadata: &str) -> Value {
    let (status, _, created) = create_transfer(app, importer_id, csv.len(), metadata).await;
    assert_eq!(status, StatusCode::CREATED);
    let tus_id = created["tus_id"].as_str().unwrap().to_string();

    let (status, _, _) = patch_chunk(app, &tus_id, 0, csv.as_bytes()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    poll(app, &format!("/file-import/v1/upload/{}", tus_id), |u| u["is_stored"] == true).await
}

const CONTACTS_CSV: &str = "Name,Email,Phone\n\
Ada Lovelace,ada@example.com,555-0100\n\
Alan Turing,alan@example.com,555-0101\n\
Grace Hopper,grace-at-example,555-0102\n\
Edsger Dijkstra,edsger@example.com,\n\
,anon@example.com,555-0104\n\
Barbara Liskov,barbara@example.com,555-0105\n\
Donald Knuth,don@example.com,555-0106\n\
Ken Thompson,not an email,555-0107\n\
Margaret Hamilton,margaret@example.com,555-0108\n";

const VALID_CSV: &str = "Name,Email\n\
Ada Lovelace,ada@example.com\n\
Alan Turing,alan@example.com\n\
Grace Hopper,grace@example.com\n\
Edsger Dijkstra,edsger@example.com\n\
Barbara Liskov,barbara@example.com\n\
Donald Knuth,don@example.com\n\
Ken Thompson,ken@example.com\n\
Margaret Hamilton,margaret@example.com\n\
Frances Allen,fran@example.com\n";

/// Select header row 0, map suggested columns, wait for the stored import
async fn map_and_materialize(app: &Router, upload: &Value) -> (String, Value) {
    let upload_id = upload["id"].as_str().unwrap().to_string();

    let (status, upload) = post_json(
        app,
        &format!("/file-import/v1/upload/{}/set-header-row", upload_id),
        json!({"index": 0}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", upload);

    let mapping: serde_json::Map<String, Value> = upload["upload_columns"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|c| !c["suggested_template_column_id"].is_null())
        .map(|c| {
            (
                c["id"].as_str().unwrap().to_string(),
                c["suggested_template_column_id"].clone(),
            )
        })
        .collect();

    let (status, started) = post_json(
        app,
        &format!("/file-import/v1/upload/{}/set-column-mapping", upload_id),
        Value::Object(mapping),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", started);
    assert_eq!(started["message"], "Import triggered");

    let review = poll(
        app,
        &format!("/file-import/v1/import/{}/review", upload_id),
        |r| r["is_stored"] == true,
    )
    .await;
    (upload_id, review)
}

#[tokio::test]
async fn test_health_endpoint() {
    let test = create_test_app(PipelineConfig::default()).await;

    let (status, body) = get(&test.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "tabflow-fi");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_tus_options_advertises_creation() {
    let test = create_test_app(PipelineConfig::default()).await;

    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/file-import/v1/files")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&test.app, req).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers["tus-version"], "1.0.0");
    assert_eq!(headers["tus-extension"], "creation");
    assert_eq!(
        headers["tus-max-size"].to_str().unwrap(),
        PipelineConfig::default().max_upload_bytes.to_string()
    );
}

#[tokio::test]
async fn test_transfer_creation_errors() {
    let test = create_test_app(PipelineConfig {
        max_upload_bytes: 1024,
        ..PipelineConfig::default()
    })
    .await;
    let importer = seed_importer(&test, contacts_importer()).await;

    // No importer header
    let req = request(Method::POST, "/file-import/v1/files")
        .header("upload-length", "10")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&test.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("X-Importer-ID"));

    // Declared length above the limit
    let (status, _, _) = create_transfer(&test.app, importer.id, 4096, "").await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    // Unknown importer
    let (status, _, _) = create_transfer(&test.app, Uuid::new_v4(), 10, "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_foreign_referer_is_denied() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(&test, contacts_importer()).await;

    let req = Request::builder()
        .method(Method::POST)
        .uri("/file-import/v1/files")
        .header(header::REFERER, "https://attacker.test/page")
        .header("x-importer-id", importer.id.to_string())
        .header("upload-length", "10")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&test.app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "ACCESS_DENIED");

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("/file-import/v1/importer/{}", importer.id))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&test.app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_importer_lookup_modes() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(&test, contacts_importer()).await;
    let uri = format!("/file-import/v1/importer/{}", importer.id);

    let req = request(Method::POST, &uri).body(Body::empty()).unwrap();
    let (status, _, stored) = send(&test.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["template"]["columns"].as_array().unwrap().len(), 3);

    let req = request(Method::POST, &format!("{}?schemaless=true", uri))
        .body(Body::empty())
        .unwrap();
    let (status, _, schemaless) = send(&test.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(schemaless["template"]["columns"].as_array().unwrap().is_empty());

    let (status, overridden) = post_json(
        &test.app,
        &uri,
        json!({"columns": [{"name": "Order Number", "required": true}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(overridden["template"]["columns"][0]["key"], "order_number");

    let (status, _) = post_json(&test.app, &uri, json!({"columns": [{"name": "A", "key": "a b"}]})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // An importer without a template has nothing to return in stored mode
    let bare = seed_importer(
        &test,
        json!({"id": Uuid::new_v4(), "name": "Bare", "allowed_domains": ["example.com"]}),
    )
    .await;
    let req = request(Method::POST, &format!("/file-import/v1/importer/{}", bare.id))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&test.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Template not attached to importer");
}

#[tokio::test]
async fn test_resumable_transfer_offsets() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(&test, contacts_importer()).await;
    let bytes = CONTACTS_CSV.as_bytes();

    let metadata = metadata_header(&[("filename", Some("contacts.csv")), ("filetype", Some("text/csv"))]);
    let (status, headers, created) = create_transfer(&test.app, importer.id, bytes.len(), &metadata).await;
    assert_eq!(status, StatusCode::CREATED);
    let tus_id = created["tus_id"].as_str().unwrap().to_string();
    assert_eq!(
        headers[header::LOCATION].to_str().unwrap(),
        format!("/file-import/v1/files/{}", tus_id)
    );
    assert_eq!(created["file_name"], "contacts.csv");

    let (status, headers, _) = patch_chunk(&test.app, &tus_id, 0, &bytes[..40]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers["upload-offset"], "40");

    // Replaying the first chunk is rejected
    let (status, _, _) = patch_chunk(&test.app, &tus_id, 0, &bytes[..40]).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Wrong content type
    let req = request(Method::PATCH, &format!("/file-import/v1/files/{}", tus_id))
        .header("upload-offset", "40")
        .header(header::CONTENT_TYPE, "text/csv")
        .body(Body::from(bytes[40..].to_vec()))
        .unwrap();
    let (status, _, _) = send(&test.app, req).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let req = request(Method::HEAD, &format!("/file-import/v1/files/{}", tus_id))
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&test.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["upload-offset"], "40");
    assert_eq!(headers["upload-length"], bytes.len().to_string());

    let (status, headers, _) = patch_chunk(&test.app, &tus_id, 40, &bytes[40..]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers["upload-offset"], bytes.len().to_string());

    let upload = poll(&test.app, &format!("/file-import/v1/upload/{}", tus_id), |u| {
        u["is_stored"] == true
    })
    .await;
    assert_eq!(upload["num_rows"], 10);
    assert_eq!(upload["num_columns"], 3);
    assert_eq!(upload["upload_rows"].as_array().unwrap().len(), 10);
    assert_eq!(upload["upload_rows"][0]["values"][0], "Name");
}

#[tokio::test]
async fn test_header_row_bounds() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(&test, contacts_importer()).await;
    let upload = upload_stored(&test.app, importer.id, CONTACTS_CSV, "").await;
    let uri = format!("/file-import/v1/upload/{}/set-header-row", upload["id"].as_str().unwrap());

    for body in [json!({}), json!({"index": -1}), json!({"index": 10}), json!({"index": 9})] {
        let (status, response) = post_json(&test.app, &uri, body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{} -> {}", body, response);
    }

    let (status, selected) = post_json(&test.app, &uri, json!({"index": 0})).await;
    assert_eq!(status, StatusCode::OK);
    let columns = selected["upload_columns"].as_array().unwrap();
    assert_eq!(columns.len(), 3);
    assert_eq!(columns[1]["name"], "Email");
    assert_eq!(columns[1]["sample_data"][0], "ada@example.com");
    assert!(columns.iter().all(|c| !c["suggested_template_column_id"].is_null()));

    // Reselection before an import exists replaces the columns
    let (status, reselected) = post_json(&test.app, &uri, json!({"index": 1})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reselected["header_row_index"], 1);
    assert_eq!(reselected["upload_columns"][0]["name"], "Ada Lovelace");
}

#[tokio::test]
async fn test_full_import_with_errors() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(&test, contacts_importer()).await;
    let mut events = test.state.event_bus.subscribe();

    let upload = upload_stored(&test.app, importer.id, CONTACTS_CSV, "").await;
    let (upload_id, review) = map_and_materialize(&test.app, &upload).await;

    assert_eq!(review["num_rows"], 9);
    assert_eq!(review["num_valid_rows"], 6);
    assert_eq!(review["num_error_rows"], 3);
    assert_eq!(review["num_processed_values"], 27);
    assert_eq!(review["has_errors"], true);
    assert_eq!(review["data"]["filter"], "all");
    assert_eq!(review["data"]["pagination"]["total"], 9);
    assert_eq!(review["data"]["rows"].as_array().unwrap().len(), 9);
    assert_eq!(review["data"]["rows"][0]["values"]["email"], "ada@example.com");

    // Error window
    let (status, page) = get(
        &test.app,
        &format!("/file-import/v1/import/{}/rows?filter=error&limit=2", upload_id),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["pagination"]["total"], 3);
    assert_eq!(page["pagination"]["limit"], 2);
    let rows = page["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["index"], 2);
    assert!(rows[0]["errors"]["email"].is_array());
    assert_eq!(rows[1]["index"], 4);
    assert_eq!(rows[1]["errors"]["name"][0]["message"], "Name is required");

    let (_, page) = get(
        &test.app,
        &format!("/file-import/v1/import/{}/rows?filter=error&offset=2", upload_id),
    )
    .await;
    assert_eq!(page["rows"][0]["index"], 7);

    let (_, page) = get(&test.app, &format!("/file-import/v1/import/{}/rows?filter=valid", upload_id)).await;
    assert_eq!(page["pagination"]["total"], 6);
    assert_eq!(page["rows"].as_array().unwrap().len(), 6);

    for query in ["filter=bogus", "limit=0", "offset=-1", "limit=abc"] {
        let (status, _) = get(&test.app, &format!("/file-import/v1/import/{}/rows?{}", upload_id, query)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", query);
    }

    let (status, body) = post_json(&test.app, &format!("/file-import/v1/import/{}/submit", upload_id), json!(null)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "All errors must be resolved before submitting");

    // The upload is frozen once an import exists
    let (status, _) = post_json(
        &test.app,
        &format!("/file-import/v1/upload/{}/set-header-row", upload_id),
        json!({"index": 0}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type());
    }
    assert!(seen.contains(&"HeaderRowSelected"));
    assert!(seen.contains(&"MaterializationStarted"));
}

#[tokio::test]
async fn test_second_mapping_conflicts() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(&test, contacts_importer()).await;
    let upload = upload_stored(&test.app, importer.id, VALID_CSV, "").await;
    let (upload_id, _) = map_and_materialize(&test.app, &upload).await;

    let stored = poll(&test.app, &format!("/file-import/v1/upload/{}", upload["tus_id"].as_str().unwrap()), |_| true).await;
    let column_id = stored["upload_columns"][0]["id"].as_str().unwrap().to_string();
    let template_column_id = importer.template.as_ref().unwrap().columns[0].id.to_string();

    let (status, body) = post_json(
        &test.app,
        &format!("/file-import/v1/upload/{}/set-column-mapping", upload_id),
        json!({ column_id: template_column_id }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{}", body);
}

#[tokio::test]
async fn test_mapping_requires_required_columns() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(&test, contacts_importer()).await;
    let upload = upload_stored(&test.app, importer.id, VALID_CSV, "").await;
    let upload_id = upload["id"].as_str().unwrap();

    let (_, selected) = post_json(
        &test.app,
        &format!("/file-import/v1/upload/{}/set-header-row", upload_id),
        json!({"index": 0}),
    )
    .await;
    let name_column = selected["upload_columns"][0]["id"].as_str().unwrap().to_string();
    let email_column = selected["upload_columns"][1]["id"].as_str().unwrap().to_string();
    let template = importer.template.as_ref().unwrap();
    let uri = format!("/file-import/v1/upload/{}/set-column-mapping", upload_id);

    let (status, body) = post_json(&test.app, &uri, json!({ name_column.clone(): template.columns[0].id })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("All required columns must be set"));

    let (status, body) = post_json(
        &test.app,
        &uri,
        json!({ name_column.clone(): template.columns[0].id, email_column.clone(): template.columns[0].id }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("unique"));

    let (status, _) = post_json(&test.app, &uri, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        &test.app,
        &uri,
        json!({ name_column: template.columns[0].id, email_column: template.columns[1].id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_submit_returns_rows_inline_once() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(&test, contacts_importer()).await;
    let metadata = metadata_header(&[("metadata", Some(r#"{"batch": 42}"#))]);
    let upload = upload_stored(&test.app, importer.id, VALID_CSV, &metadata).await;
    let (upload_id, review) = map_and_materialize(&test.app, &upload).await;
    assert_eq!(review["has_errors"], false);
    assert_eq!(review["metadata"]["batch"], 42);

    let mut events = test.state.event_bus.subscribe();
    let uri = format!("/file-import/v1/import/{}/submit", upload_id);

    let (status, first) = post_json(&test.app, &uri, json!(null)).await;
    assert_eq!(status, StatusCode::OK, "{}", first);
    assert_eq!(first["rows"].as_array().unwrap().len(), 9);
    assert!(first["rows_withheld"].is_null());
    assert!(first["submitted_at"].is_string());
    assert_eq!(first["rows"][8]["values"]["name"], "Frances Allen");

    let (status, second) = post_json(&test.app, &uri, json!(null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["rows"], first["rows"]);
    assert!(second["submitted_at"].is_string());

    let mut submitted = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PipelineEvent::ImportSubmitted { .. }) {
            submitted += 1;
        }
    }
    assert_eq!(submitted, 1);
}

#[tokio::test]
async fn test_submit_withholds_large_imports() {
    let test = create_test_app(PipelineConfig {
        pass_through_max_rows: 5,
        ..PipelineConfig::default()
    })
    .await;
    let importer = seed_importer(&test, contacts_importer()).await;
    let upload = upload_stored(&test.app, importer.id, VALID_CSV, "").await;
    let (upload_id, _) = map_and_materialize(&test.app, &upload).await;

    let (status, body) = post_json(&test.app, &format!("/file-import/v1/import/{}/submit", upload_id), json!(null)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert!(body["rows"].as_array().unwrap().is_empty());
    assert_eq!(body["rows_withheld"]["num_rows"], 9);
    assert_eq!(body["rows_withheld"]["max_rows"], 5);
    assert_eq!(
        body["rows_withheld"]["rows_path"],
        format!("/file-import/v1/import/{}/rows", upload_id)
    );
}

#[tokio::test]
async fn test_schemaless_upload_builds_template_from_keys() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(
        &test,
        json!({"id": Uuid::new_v4(), "name": "Anything", "allowed_domains": []}),
    )
    .await;

    let metadata = metadata_header(&[("schemaless", None)]);
    let upload = upload_stored(&test.app, importer.id, VALID_CSV, &metadata).await;
    let upload_id = upload["id"].as_str().unwrap();

    let (status, selected) = post_json(
        &test.app,
        &format!("/file-import/v1/upload/{}/set-header-row", upload_id),
        json!({"index": 0}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let name_column = selected["upload_columns"][0]["id"].as_str().unwrap().to_string();
    let email_column = selected["upload_columns"][1]["id"].as_str().unwrap().to_string();
    let uri = format!("/file-import/v1/upload/{}/set-column-mapping", upload_id);

    let (status, body) = post_json(&test.app, &uri, json!({ name_column.clone(): "full name" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("'full name'"));

    let (status, _) = post_json(
        &test.app,
        &uri,
        json!({ name_column: "full_name", email_column: "email_address" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let review = poll(&test.app, &format!("/file-import/v1/import/{}/review", upload_id), |r| {
        r["is_stored"] == true
    })
    .await;
    assert_eq!(review["num_valid_rows"], 9);
    assert_eq!(review["data"]["rows"][0]["values"]["full_name"], "Ada Lovelace");
    assert_eq!(review["data"]["rows"][0]["values"]["email_address"], "ada@example.com");
}

#[tokio::test]
async fn test_skip_header_row_selection() {
    let test = create_test_app(PipelineConfig::default()).await;
    let mut definition = contacts_importer();
    definition["skip_header_row_selection"] = json!(true);
    let importer = seed_importer(&test, definition).await;

    let upload = upload_stored(&test.app, importer.id, VALID_CSV, "").await;
    let tus_id = upload["tus_id"].as_str().unwrap();

    let upload = poll(&test.app, &format!("/file-import/v1/upload/{}", tus_id), |u| {
        u["header_row_index"] == 0
    })
    .await;
    assert_eq!(upload["upload_columns"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unparseable_upload_reports_error() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(&test, contacts_importer()).await;

    let content = b"not really a spreadsheet";
    let metadata = metadata_header(&[("filename", Some("book.xlsx"))]);
    let (status, _, created) = create_transfer(&test.app, importer.id, content.len(), &metadata).await;
    assert_eq!(status, StatusCode::CREATED);
    let tus_id = created["tus_id"].as_str().unwrap().to_string();
    let (status, _, _) = patch_chunk(&test.app, &tus_id, 0, content).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let uri = format!("/file-import/v1/upload/{}", tus_id);
    for _ in 0..400 {
        let (status, body) = get(&test.app, &uri).await;
        if status == StatusCode::BAD_REQUEST {
            assert!(body["error"]["message"].as_str().unwrap().contains("Excel"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("Upload error was never reported");
}

#[tokio::test]
async fn test_unknown_ids() {
    let test = create_test_app(PipelineConfig::default()).await;

    let (status, _) = get(&test.app, &format!("/file-import/v1/import/{}/review", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&test.app, "/file-import/v1/import/not-a-uuid/review").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&test.app, "/file-import/v1/upload/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_event_stream_is_scoped_to_an_allowed_upload() {
    let test = create_test_app(PipelineConfig::default()).await;
    let importer = seed_importer(&test, contacts_importer()).await;
    let upload = tabflow_fi::models::Upload::new(importer.id, 10);
    test.state.pipeline.metadata().create_upload(&upload).await.unwrap();
    let uri = format!("/file-import/v1/events?upload_id={}", upload.id);

    let foreign = Request::builder()
        .uri(&uri)
        .header(header::REFERER, "https://evil.test/")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&test.app, foreign).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "ACCESS_DENIED");

    let (status, _) = get(&test.app, "/file-import/v1/events").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = get(&test.app, &format!("/file-import/v1/events?upload_id={}", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let req = request(Method::GET, &uri).body(Body::empty()).unwrap();
    let response = test.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let other_upload = Uuid::new_v4();
    for upload_id in [other_upload, upload.id] {
        test.state.event_bus.emit_lossy(PipelineEvent::UploadStored {
            upload_id,
            importer_id: importer.id,
            num_rows: 42,
            timestamp: chrono::Utc::now(),
        });
    }

    let mut body = response.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("no event within 5s")
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(text.starts_with("event: UploadStored"), "{}", text);
    assert!(text.contains(&upload.id.to_string()));
    assert!(!text.contains(&other_upload.to_string()));
}

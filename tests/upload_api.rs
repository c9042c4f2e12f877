//! End-to-end tests for the upload HTTP surface.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use chunk_upload_server::config::Config;
use chunk_upload_server::routes;
use chunk_upload_server::state::AppState;

async fn test_app(require_contiguous: bool) -> (axum::Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.upload_dir = dir.path().join("uploads");
    config.merge.require_contiguous = require_contiguous;

    let state = AppState::new(config).await.unwrap();
    (routes::router(state), dir)
}

async fn test_server() -> (TestServer, TempDir) {
    let (router, dir) = test_app(false).await;
    (TestServer::new(router).unwrap(), dir)
}

fn chunk_form(file_key: &str, index: &str, data: &[u8]) -> MultipartForm {
    MultipartForm::new()
        .add_text("fileKey", file_key.to_string())
        .add_text("chunkIndex", index.to_string())
        .add_part("file", Part::bytes(data.to_vec()).file_name("blob"))
}

async fn upload(server: &TestServer, file_key: &str, index: u64, data: &[u8]) {
    let response = server
        .post("/upload/chunk")
        .multipart(chunk_form(file_key, &index.to_string(), data))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

async fn status(server: &TestServer, file_key: &str) -> Vec<u64> {
    let body: Value = server
        .get("/upload/chunk/status")
        .add_query_param("fileKey", file_key)
        .await
        .json();
    body["uploadedChunks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_out_of_order_upload_merges_in_index_order() {
    let (server, dir) = test_server().await;
    let key = "video.mp4-chunk";

    upload(&server, key, 2, b"CC").await;
    upload(&server, key, 0, b"AA").await;
    upload(&server, key, 1, b"BB").await;

    assert_eq!(status(&server, key).await, vec![0, 1, 2]);

    let response = server
        .post("/upload/merge")
        .json(&json!({ "fileKey": key }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["message"], "File merged successfully.");
    assert_eq!(body["size"], 6);
    assert_eq!(body["chunkCount"], 3);
    assert_eq!(body["sha256"].as_str().unwrap().len(), 64);

    let merged = dir.path().join("uploads").join("files").join("video.mp4");
    assert_eq!(std::fs::read(&merged).unwrap(), b"AABBCC");
    assert_eq!(body["filePath"], merged.to_string_lossy().as_ref());

    // Staging is gone once the file is in place
    assert!(status(&server, key).await.is_empty());
}

#[tokio::test]
async fn test_payload_before_fields_is_accepted() {
    let (server, dir) = test_server().await;

    let form = MultipartForm::new()
        .add_part("file", Part::bytes(b"late keys".to_vec()).file_name("blob"))
        .add_text("fileKey", "doc")
        .add_text("chunkIndex", "0");
    let response = server.post("/upload/chunk").multipart(form).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["message"], "Chunk uploaded successfully.");

    let staged = dir.path().join("uploads").join("chunks").join("doc").join("0");
    assert_eq!(std::fs::read(staged).unwrap(), b"late keys");
}

#[tokio::test]
async fn test_reupload_replaces_chunk() {
    let (server, dir) = test_server().await;

    upload(&server, "k", 0, b"first").await;
    upload(&server, "k", 0, b"second").await;
    assert_eq!(status(&server, "k").await, vec![0]);

    server
        .post("/upload/merge")
        .json(&json!({ "fileKey": "k" }))
        .await
        .assert_status_ok();
    let merged = dir.path().join("uploads").join("files").join("k");
    assert_eq!(std::fs::read(merged).unwrap(), b"second");
}

#[tokio::test]
async fn test_status_of_unknown_upload_is_empty() {
    let (server, _dir) = test_server().await;
    assert!(status(&server, "never-seen").await.is_empty());
}

#[tokio::test]
async fn test_traversal_key_is_rejected() {
    let (server, dir) = test_server().await;

    let response = server
        .post("/upload/chunk")
        .multipart(chunk_form("../../etc", "0", b"x"))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["code"], "INVALID_ARGUMENT");

    let response = server
        .get("/upload/chunk/status")
        .add_query_param("fileKey", "../secrets")
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server
        .post("/upload/merge")
        .json(&json!({ "fileKey": "a/b" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    assert!(!dir.path().join("etc").exists());
}

#[tokio::test]
async fn test_missing_parameters() {
    let (server, _dir) = test_server().await;

    let form = MultipartForm::new()
        .add_text("chunkIndex", "0")
        .add_part("file", Part::bytes(b"x".to_vec()).file_name("blob"));
    let response = server.post("/upload/chunk").multipart(form).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let form = MultipartForm::new()
        .add_text("fileKey", "k")
        .add_text("chunkIndex", "0");
    let response = server.post("/upload/chunk").multipart(form).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server.get("/upload/chunk/status").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["message"], "Missing fileKey parameter.");

    let response = server.post("/upload/merge").json(&json!({})).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server.post("/upload/merge").text("fileKey=k").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_chunk_index() {
    let (server, _dir) = test_server().await;

    for index in ["-1", "abc", "1.5", ""] {
        let response = server
            .post("/upload/chunk")
            .multipart(chunk_form("k", index, b"x"))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST, "index {:?}", index);
    }
    assert!(status(&server, "k").await.is_empty());
}

#[tokio::test]
async fn test_merge_unknown_upload() {
    let (server, _dir) = test_server().await;

    let response = server
        .post("/upload/merge")
        .json(&json!({ "fileKey": "ghost" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_second_merge_and_late_chunk() {
    let (server, _dir) = test_server().await;

    upload(&server, "once", 0, b"data").await;
    server
        .post("/upload/merge")
        .json(&json!({ "fileKey": "once" }))
        .await
        .assert_status_ok();

    let response = server
        .post("/upload/merge")
        .json(&json!({ "fileKey": "once" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["code"], "NOT_FOUND");

    let response = server
        .post("/upload/chunk")
        .multipart(chunk_form("once", "1", b"late"))
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    assert_eq!(response.json::<Value>()["code"], "CONFLICT");
}

#[tokio::test]
async fn test_merge_with_expected_total() {
    let (server, dir) = test_server().await;

    upload(&server, "parts", 0, b"a").await;
    upload(&server, "parts", 2, b"c").await;

    let response = server
        .post("/upload/merge")
        .json(&json!({ "fileKey": "parts", "totalChunks": 3 }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["code"], "INCOMPLETE_UPLOAD");

    // Nothing was consumed by the failed attempt
    assert_eq!(status(&server, "parts").await, vec![0, 2]);

    upload(&server, "parts", 1, b"b").await;
    server
        .post("/upload/merge")
        .json(&json!({ "fileKey": "parts", "totalChunks": 3 }))
        .await
        .assert_status_ok();
    let merged = dir.path().join("uploads").join("files").join("parts");
    assert_eq!(std::fs::read(merged).unwrap(), b"abc");
}

#[tokio::test]
async fn test_merge_accepts_form_body() {
    let (server, dir) = test_server().await;

    upload(&server, "f", 0, b"form").await;
    upload(&server, "f", 1, b"-body").await;

    let response = server
        .post("/upload/merge")
        .form(&[("fileKey", "f"), ("totalChunks", "2")])
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["chunkCount"], 2);

    let merged = dir.path().join("uploads").join("files").join("f");
    assert_eq!(std::fs::read(merged).unwrap(), b"form-body");

    let response = server
        .post("/upload/merge")
        .form(&[("totalChunks", "2")])
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["message"], "Missing fileKey parameter.");
}

#[tokio::test]
async fn test_dotted_key_is_accepted() {
    let (server, dir) = test_server().await;

    upload(&server, "v1..2.zip-chunk", 0, b"zip").await;
    server
        .post("/upload/merge")
        .json(&json!({ "fileKey": "v1..2.zip-chunk" }))
        .await
        .assert_status_ok();

    let merged = dir.path().join("uploads").join("files").join("v1..2.zip");
    assert_eq!(std::fs::read(merged).unwrap(), b"zip");
}

#[tokio::test]
async fn test_contiguous_policy_rejects_gaps() {
    let (router, _dir) = test_app(true).await;
    let server = TestServer::new(router).unwrap();

    upload(&server, "gappy", 0, b"a").await;
    upload(&server, "gappy", 2, b"c").await;

    let response = server
        .post("/upload/merge")
        .json(&json!({ "fileKey": "gappy" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["code"], "INCOMPLETE_UPLOAD");
}

#[tokio::test]
async fn test_health() {
    let (router, _dir) = test_app(false).await;

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "chunk-upload-server");
}

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use benchseal_core::{ClockSource, FixedClock};
use benchseal_crypto::{EncryptedEnvelope, seal_envelope, test_key_pair};
use chrono::DateTime;
use serde_json::{Value, json};
use tower::ServiceExt;

use benchseal_verifier::server::{AppState, build_router};
use benchseal_verifier::{
    KeyRing, ReplayGuard, ResultDatabase, UploadService, VerificationPipeline,
};

const NOW: i64 = 1_750_000_000;
const BOUNDARY: &str = "benchseal-test-boundary";
const MAX_UPLOAD: usize = 64 * 1024;

struct TestApp {
    router: axum::Router,
    db: ResultDatabase,
}

async fn test_app() -> TestApp {
    let (private, _) = test_key_pair();
    let clock: Arc<dyn ClockSource> = Arc::new(FixedClock::new(NOW));
    let pipeline = Arc::new(VerificationPipeline::new(
        Arc::new(KeyRing::new(private).unwrap()),
        Arc::new(ReplayGuard::new(Duration::from_secs(600))),
        Arc::clone(&clock),
        300,
    ));
    let db = ResultDatabase::open_in_memory().await.unwrap();
    let uploads = UploadService::new(db.clone(), pipeline);
    TestApp {
        router: build_router(AppState { uploads, clock }, MAX_UPLOAD),
        db,
    }
}

fn seal(payload: &Value, api_key: &str) -> EncryptedEnvelope {
    let (_, public) = test_key_pair();
    seal_envelope(payload, api_key, &public, DateTime::from_timestamp(NOW, 0).unwrap()).unwrap()
}

fn multipart_body(file: &[u8], metadata: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"envelope.json\"\r\nContent-Type: application/json\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(file);
    body.extend_from_slice(b"\r\n");
    if let Some(metadata) = metadata {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"metadata\"\r\n\r\n{metadata}\r\n")
                .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let resp = app.router.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn upload(
    app: &TestApp,
    api_key: Option<&str>,
    file: &[u8],
    metadata: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/benchmark-result/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    let body = multipart_body(file, metadata);
    builder = builder.header("content-length", body.len());
    send(app, builder.body(Body::from(body)).unwrap()).await
}

async fn status(app: &TestApp, upload_id: &str, api_key: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .uri(format!("/api/v1/benchmark-result/{upload_id}/status"))
        .header("x-api-key", api_key)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

/// Poll the status endpoint until processing finishes.
async fn wait_for_final(app: &TestApp, upload_id: &str, api_key: &str) -> Value {
    for _ in 0..500 {
        let (code, body) = status(app, upload_id, api_key).await;
        assert_eq!(code, StatusCode::OK, "{body}");
        if matches!(
            body["processing_status"].as_str(),
            Some("completed" | "failed")
        ) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("upload {upload_id} never finished");
}

async fn upload_and_wait(app: &TestApp, envelope: &EncryptedEnvelope, api_key: &str) -> Value {
    let (code, body) = upload(app, Some(api_key), &serde_json::to_vec(envelope).unwrap(), None).await;
    assert_eq!(code, StatusCode::OK, "{body}");
    wait_for_final(app, body["upload_id"].as_str().unwrap(), api_key).await
}

#[tokio::test]
async fn upload_then_status_completes() {
    let app = test_app().await;
    let envelope = serde_json::to_vec(&seal(&json!({"a": 1}), "k1")).unwrap();

    let (code, body) = upload(&app, Some("k1"), &envelope, Some(r#"{"runner":"ci"}"#)).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["processing_status"], "pending");

    let upload_id = body["upload_id"].as_str().unwrap();
    let done = wait_for_final(&app, upload_id, "k1").await;
    assert_eq!(done["processing_status"], "completed", "{done}");
    assert_eq!(done["validation"]["is_valid"], true);

    let result_id = done["result_id"].as_str().unwrap();
    let stored = app.db.get_validated_result(result_id).await.unwrap();
    assert_eq!(serde_json::from_str::<Value>(&stored.payload).unwrap(), json!({"a": 1}));
    assert_eq!(stored.metadata.as_deref(), Some(r#"{"runner":"ci"}"#));
}

#[tokio::test]
async fn resubmission_is_rejected_as_replay() {
    let app = test_app().await;
    let envelope = seal(&json!({"a": 1}), "k1");

    let first = upload_and_wait(&app, &envelope, "k1").await;
    assert_eq!(first["processing_status"], "completed");

    let second = upload_and_wait(&app, &envelope, "k1").await;
    assert_eq!(second["processing_status"], "failed");
    assert_eq!(second["validation"]["nonce_valid"], false);
    assert!(second["result_id"].is_null());
    assert_eq!(app.db.count_validated_results().await.unwrap(), 1);
}

#[tokio::test]
async fn wrong_api_key_fails_binding() {
    let app = test_app().await;
    let envelope = seal(&json!({"a": 1}), "k1");

    let done = upload_and_wait(&app, &envelope, "k2").await;
    assert_eq!(done["processing_status"], "failed");
    assert_eq!(done["validation"]["api_key_valid"], false);
    assert_eq!(done["validation"]["errors"][0]["code"], "E1004");
}

#[tokio::test]
async fn missing_api_key_is_unauthorized() {
    let app = test_app().await;
    let envelope = serde_json::to_vec(&seal(&json!({"a": 1}), "k1")).unwrap();

    let (code, body) = upload(&app, None, &envelope, None).await;
    assert_eq!(code, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "E1005");
}

#[tokio::test]
async fn non_json_upload_is_rejected_immediately() {
    let app = test_app().await;

    let (code, body) = upload(&app, Some("k1"), b"not json", None).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "E1001");
}

#[tokio::test]
async fn malformed_envelope_gets_stored_format_report() {
    let app = test_app().await;

    let (code, body) = upload(&app, Some("k1"), br#"{"format_version":"9.9"}"#, None).await;
    assert_eq!(code, StatusCode::OK, "{body}");
    let upload_id = body["upload_id"].as_str().unwrap();

    let done = wait_for_final(&app, upload_id, "k1").await;
    assert_eq!(done["processing_status"], "failed");
    assert!(done["result_id"].is_null());
    let report = &done["validation"];
    assert_eq!(report["format_valid"], false);
    assert_eq!(report["is_valid"], false);
    assert_eq!(report["errors"][0]["stage"], "FORMAT_CHECK");
    assert_eq!(report["errors"][0]["code"], "E1001");

    let row = app.db.get_upload(upload_id).await.unwrap();
    assert!(row.report.is_some());
}

#[tokio::test]
async fn invalid_metadata_is_rejected() {
    let app = test_app().await;
    let envelope = serde_json::to_vec(&seal(&json!({"a": 1}), "k1")).unwrap();

    let (code, body) = upload(&app, Some("k1"), &envelope, Some("{oops")).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "E1001");
}

#[tokio::test]
async fn status_is_scoped_to_submitting_key() {
    let app = test_app().await;
    let envelope = serde_json::to_vec(&seal(&json!({"a": 1}), "k1")).unwrap();

    let (_, body) = upload(&app, Some("k1"), &envelope, None).await;
    let upload_id = body["upload_id"].as_str().unwrap();

    let (code, body) = status(&app, upload_id, "someone-else").await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn oversized_upload_is_refused() {
    let app = test_app().await;
    let big = vec![b'x'; MAX_UPLOAD * 2];

    let (code, _) = upload(&app, Some("k1"), &big, None).await;
    assert_eq!(code, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn time_endpoint_reports_server_clock() {
    let app = test_app().await;
    let request = Request::builder()
        .uri("/api/v1/time")
        .body(Body::empty())
        .unwrap();

    let (code, body) = send(&app, request).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["server_time"], NOW * 1000);
}

#[tokio::test]
async fn health_is_ok() {
    let app = test_app().await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let (code, body) = send(&app, request).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use benchseal_core::ClockSource;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use super::error::ApiError;
use crate::pipeline::ErrorCode;
use crate::service::UploadService;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadService,
    pub clock: Arc<dyn ClockSource>,
}

/// Build the verifier router.
pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/time", get(server_time))
        .route("/api/v1/benchmark-result/upload", post(upload))
        .route("/api/v1/benchmark-result/{upload_id}/status", get(status))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

fn multipart_error(e: &MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, ErrorCode::E1001, "upload too large")
    } else {
        ApiError::bad_request(format!("invalid multipart body: {}", e.body_text()))
    }
}

/// `GET /health`
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /api/v1/time`: server clock in Unix milliseconds.
async fn server_time(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "server_time": state.clock.now().timestamp_millis() }))
}

/// `POST /api/v1/benchmark-result/upload`
async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let key = api_key(&headers).ok_or_else(ApiError::unauthorized)?;

    let mut file = None;
    let mut metadata = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| multipart_error(&e))? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                file = Some(field.bytes().await.map_err(|e| multipart_error(&e))?.to_vec());
            }
            Some("metadata") => {
                metadata = Some(field.text().await.map_err(|e| multipart_error(&e))?);
            }
            other => debug!(field = ?other, "Ignoring unknown multipart field"),
        }
    }
    let file = file.ok_or_else(|| ApiError::bad_request("missing file field"))?;

    let submitted = state.uploads.submit(key, file, metadata).await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "upload_id": submitted.upload_id,
            "processing_status": "pending",
        })),
    ))
}

/// `GET /api/v1/benchmark-result/{upload_id}/status`
async fn status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let key = api_key(&headers).ok_or_else(ApiError::unauthorized)?;
    match state.uploads.status(&upload_id, key).await? {
        Some(status) => Ok(Json(status)),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            ErrorCode::E1001,
            format!("upload {upload_id} not found"),
        )),
    }
}

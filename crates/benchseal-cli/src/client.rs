//! HTTP client for the verification server.
//!
//! Uses reqwest to call the upload, status and time endpoints.

use std::time::Duration;

use benchseal_core::ClientConfig;
use benchseal_verifier::server::API_KEY_HEADER;
use benchseal_verifier::{ProcessingStatus, ValidationReport};
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Verifier API client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Verifier API error ({status}) {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Reply to an accepted upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadReceipt {
    pub upload_id: String,
    pub processing_status: ProcessingStatus,
}

/// Reply of the status endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub processing_status: ProcessingStatus,
    pub validation: Option<ValidationReport>,
    pub result_id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct ServerTime {
    server_time: i64,
}

/// Verification server API client.
#[derive(Debug, Clone)]
pub struct VerifierClient {
    http: reqwest::Client,
    base_url: String,
}

impl VerifierClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ClientError::Config("server URL is empty".into()));
        }

        // reqwest is built with rustls-no-provider; `Err` means one is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        Self::new(
            &config.server_url,
            Duration::from_secs(config.request_timeout_secs.max(1)),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(api_error(
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown"),
            &body,
        ))
    }

    /// The verifier's clock.
    pub async fn server_time(&self) -> Result<DateTime<Utc>, ClientError> {
        let resp = self.http.get(self.api_url("/time")).send().await?;
        let time: ServerTime = Self::check_status(resp).await?.json().await?;
        DateTime::from_timestamp_millis(time.server_time).ok_or_else(|| {
            ClientError::InvalidResponse(format!("server_time out of range: {}", time.server_time))
        })
    }

    /// Upload a sealed envelope for verification.
    pub async fn upload(
        &self,
        api_key: &str,
        envelope: Vec<u8>,
        file_name: &str,
        metadata: Option<&str>,
    ) -> Result<UploadReceipt, ClientError> {
        let size = envelope.len();
        let file = Part::bytes(envelope)
            .file_name(file_name.to_string())
            .mime_str("application/json")?;
        let mut form = Form::new().part("file", file);
        if let Some(metadata) = metadata {
            form = form.text("metadata", metadata.to_string());
        }

        debug!(size, file_name, "Uploading envelope");
        let resp = self
            .http
            .post(self.api_url("/benchmark-result/upload"))
            .header(API_KEY_HEADER, api_key)
            .multipart(form)
            .send()
            .await?;
        Ok(Self::check_status(resp).await?.json().await?)
    }

    /// Current processing state of an upload.
    pub async fn status(
        &self,
        upload_id: &str,
        api_key: &str,
    ) -> Result<UploadStatusResponse, ClientError> {
        let resp = self
            .http
            .get(self.api_url(&format!("/benchmark-result/{upload_id}/status")))
            .header(API_KEY_HEADER, api_key)
            .send()
            .await?;
        Ok(Self::check_status(resp).await?.json().await?)
    }

    /// Poll the status endpoint until the upload is completed or failed.
    pub async fn wait_for_status(
        &self,
        upload_id: &str,
        api_key: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<UploadStatusResponse, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(upload_id, api_key).await?;
            if status.processing_status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::InvalidResponse(format!(
                    "upload {upload_id} still {} after {}s",
                    status.processing_status,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn api_error(status: u16, reason: &str, body: &str) -> ClientError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) => ClientError::Api {
            status,
            code: err.code,
            message: err.message,
        },
        Err(_) => ClientError::Api {
            status,
            code: String::new(),
            message: if body.trim().is_empty() {
                reason.to_string()
            } else {
                body.trim().chars().take(200).collect()
            },
        },
    }
}

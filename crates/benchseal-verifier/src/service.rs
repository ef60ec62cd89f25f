//! Upload processing.
//!
//! Every JSON upload is recorded as `pending`, verified on the blocking pool
//! in a background task, and finally marked `completed` (accepted and persisted)
//! or `failed` (rejected, report stored). The API key is held only in memory
//! for the duration of processing; the database keeps its scope fingerprint.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Result, VerifierError};
use crate::pipeline::{ErrorCode, ValidationReport, VerificationPipeline};
use crate::replay::scope_identity;
use crate::storage::{DatabaseError, NewValidatedResult, ProcessingStatus, ResultDatabase};

/// Errors a client can cause when submitting.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("missing API key")]
    MissingApiKey,

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error(transparent)]
    Verifier(#[from] VerifierError),
}

impl UploadError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingApiKey => ErrorCode::E1005,
            Self::InvalidEnvelope(_) | Self::InvalidMetadata(_) => ErrorCode::E1001,
            Self::Verifier(_) => ErrorCode::E1006,
        }
    }
}

/// A submitted upload and the task verifying it.
#[derive(Debug)]
pub struct SubmittedUpload {
    pub upload_id: String,
    pub task: JoinHandle<()>,
}

/// What the status endpoint reports for one upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadStatus {
    pub upload_id: String,
    pub processing_status: ProcessingStatus,
    pub validation: Option<ValidationReport>,
    pub result_id: Option<String>,
}

struct Job {
    upload_id: String,
    api_key: String,
    key_id: String,
    envelope: Vec<u8>,
    metadata: Option<String>,
}

/// Handle to the upload pipeline. Cheap to clone.
#[derive(Clone)]
pub struct UploadService {
    db: ResultDatabase,
    pipeline: Arc<VerificationPipeline>,
}

impl UploadService {
    pub const fn new(db: ResultDatabase, pipeline: Arc<VerificationPipeline>) -> Self {
        Self { db, pipeline }
    }

    pub const fn database(&self) -> &ResultDatabase {
        &self.db
    }

    /// Accept an upload for background verification.
    ///
    /// Only bodies that are not JSON at all are refused here. Anything else
    /// gets an upload row and a stored report, with structural problems
    /// recorded by the format stage. The key current at submission is
    /// recorded and used for processing, so a rotation in between does not
    /// matter.
    pub async fn submit(
        &self,
        api_key: &str,
        envelope: Vec<u8>,
        metadata: Option<String>,
    ) -> std::result::Result<SubmittedUpload, UploadError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(UploadError::MissingApiKey);
        }

        serde_json::from_slice::<Value>(&envelope)
            .map_err(|e| UploadError::InvalidEnvelope(format!("not valid JSON: {e}")))?;

        let metadata = metadata.filter(|m| !m.trim().is_empty());
        if let Some(raw) = &metadata {
            serde_json::from_str::<Value>(raw)
                .map_err(|e| UploadError::InvalidMetadata(e.to_string()))?;
        }

        let key = self.pipeline.keys().get_current()?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.db
            .create_upload(
                &upload_id,
                &scope_identity(api_key),
                &key.id,
                metadata.as_deref(),
            )
            .await
            .map_err(VerifierError::from)?;

        info!(
            upload_id = %upload_id,
            size = envelope.len(),
            key_id = %key.id,
            "Upload accepted for verification"
        );

        let job = Job {
            upload_id: upload_id.clone(),
            api_key: api_key.to_string(),
            key_id: key.id,
            envelope,
            metadata,
        };
        let service = self.clone();
        let task = tokio::spawn(async move {
            let upload_id = job.upload_id.clone();
            if let Err(e) = service.process(job).await {
                error!(upload_id = %upload_id, error = %e, "Upload processing failed");
                if let Err(e) = service
                    .db
                    .update_upload_status(&upload_id, ProcessingStatus::Failed)
                    .await
                {
                    error!(upload_id = %upload_id, error = %e, "Failed to mark upload as failed");
                }
            }
        });

        Ok(SubmittedUpload { upload_id, task })
    }

    async fn process(&self, job: Job) -> Result<ValidationReport> {
        let Job {
            upload_id,
            api_key,
            key_id,
            envelope,
            metadata,
        } = job;

        self.db
            .update_upload_status(&upload_id, ProcessingStatus::Processing)
            .await?;

        let pipeline = Arc::clone(&self.pipeline);
        let verification = tokio::task::spawn_blocking(move || {
            pipeline.verify_with_key_id(&envelope, &api_key, &key_id)
        })
        .await??;

        let result_id = match &verification.accepted {
            Some(accepted) => {
                let record = NewValidatedResult {
                    scope: accepted.scope.clone(),
                    nonce: accepted.nonce.clone(),
                    log_hash: accepted.log_hash.clone(),
                    payload: serde_json::to_string(&accepted.payload)?,
                    metadata,
                    signed_at: accepted.signed_at,
                };
                match self.db.save_validated_result(&record).await {
                    Ok(saved) => {
                        if !saved.created {
                            warn!(upload_id = %upload_id, result_id = %saved.id, "Result already stored");
                        }
                        Some(saved.id)
                    }
                    Err(e) => {
                        self.pipeline
                            .replay_guard()
                            .release(&accepted.scope, &accepted.nonce);
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        let status = if result_id.is_some() {
            ProcessingStatus::Completed
        } else {
            ProcessingStatus::Failed
        };
        let report = serde_json::to_string(&verification.report)?;
        self.db
            .finish_upload(&upload_id, status, &report, result_id.as_deref())
            .await?;

        info!(upload_id = %upload_id, status = %status, "Upload processed");
        Ok(verification.report)
    }

    /// Look up an upload on behalf of the API key that submitted it.
    ///
    /// Uploads of other keys are reported as absent.
    pub async fn status(&self, upload_id: &str, api_key: &str) -> Result<Option<UploadStatus>> {
        let row = match self.db.get_upload(upload_id).await {
            Ok(row) => row,
            Err(DatabaseError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if row.scope != scope_identity(api_key.trim()) {
            return Ok(None);
        }

        let processing_status = row
            .status
            .parse::<ProcessingStatus>()
            .map_err(|e| VerifierError::Storage(DatabaseError::Query(e)))?;
        let validation = row
            .report
            .as_deref()
            .map(serde_json::from_str::<ValidationReport>)
            .transpose()?;

        Ok(Some(UploadStatus {
            upload_id: row.id,
            processing_status,
            validation,
            result_id: row.result_id,
        }))
    }

    /// Mark uploads left unfinished by a previous run as failed.
    ///
    /// Their envelopes and API keys lived only in that process's memory.
    pub async fn fail_interrupted(&self) -> Result<usize> {
        let stale = self.db.list_unfinished_uploads().await?;
        for row in &stale {
            self.db
                .update_upload_status(&row.id, ProcessingStatus::Failed)
                .await?;
        }
        if !stale.is_empty() {
            warn!(count = stale.len(), "Marked interrupted uploads as failed");
        }
        Ok(stale.len())
    }
}

//! Database models for the verifier.

use serde::{Deserialize, Serialize};

/// Upload record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UploadRow {
    pub id: String,
    pub scope: String,
    pub key_id: String,
    pub status: String,
    pub metadata: Option<String>,
    /// Serialized `ValidationReport`, set once processing finishes.
    pub report: Option<String>,
    pub result_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Accepted result record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ValidatedResultRow {
    pub id: String,
    pub scope: String,
    pub nonce: String,
    pub log_hash: String,
    pub payload: String,
    pub metadata: Option<String>,
    pub signed_at: i64,
    pub created_at: i64,
}

/// Input for [`ResultDatabase::save_validated_result`](super::ResultDatabase::save_validated_result).
#[derive(Debug, Clone)]
pub struct NewValidatedResult {
    pub scope: String,
    pub nonce: String,
    pub log_hash: String,
    pub payload: String,
    pub metadata: Option<String>,
    pub signed_at: i64,
}

/// Upload processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown processing status: {other}")),
        }
    }
}

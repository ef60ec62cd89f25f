//! Structured validation report.

use serde::{Deserialize, Serialize};

/// Wire error codes shared by the report and the HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Invalid format.
    E1001,
    /// Decryption failed.
    E1002,
    /// Signature invalid.
    E1003,
    /// API key invalid.
    E1004,
    /// Unauthorized.
    E1005,
    /// Server error.
    E1006,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::E1001 => "E1001",
            Self::E1002 => "E1002",
            Self::E1003 => "E1003",
            Self::E1004 => "E1004",
            Self::E1005 => "E1005",
            Self::E1006 => "E1006",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    FormatCheck,
    KeyUnwrap,
    SignatureCheck,
    TimestampCheck,
    NonceCheck,
    ApiKeyBindingCheck,
    PayloadDecrypt,
    ContentHashCheck,
}

impl Stage {
    pub const ALL: [Self; 8] = [
        Self::FormatCheck,
        Self::KeyUnwrap,
        Self::SignatureCheck,
        Self::TimestampCheck,
        Self::NonceCheck,
        Self::ApiKeyBindingCheck,
        Self::PayloadDecrypt,
        Self::ContentHashCheck,
    ];

    pub const fn code(self) -> ErrorCode {
        match self {
            Self::FormatCheck => ErrorCode::E1001,
            Self::KeyUnwrap | Self::PayloadDecrypt => ErrorCode::E1002,
            Self::SignatureCheck
            | Self::TimestampCheck
            | Self::NonceCheck
            | Self::ContentHashCheck => ErrorCode::E1003,
            Self::ApiKeyBindingCheck => ErrorCode::E1004,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FormatCheck => "FORMAT_CHECK",
            Self::KeyUnwrap => "KEY_UNWRAP",
            Self::SignatureCheck => "SIGNATURE_CHECK",
            Self::TimestampCheck => "TIMESTAMP_CHECK",
            Self::NonceCheck => "NONCE_CHECK",
            Self::ApiKeyBindingCheck => "API_KEY_BINDING_CHECK",
            Self::PayloadDecrypt => "PAYLOAD_DECRYPT",
            Self::ContentHashCheck => "CONTENT_HASH_CHECK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub code: ErrorCode,
    pub message: String,
}

/// Per-check flags plus the ordered stage outcomes and errors.
///
/// Every flag starts `false` and is only set by a passing stage, so a stage
/// that never ran can not be mistaken for one that passed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub format_valid: bool,
    pub key_unwrap_valid: bool,
    pub signature_valid: bool,
    pub timestamp_valid: bool,
    pub nonce_valid: bool,
    pub api_key_valid: bool,
    pub decryption_valid: bool,
    pub content_hash_valid: bool,
    pub is_valid: bool,
    pub stages: Vec<StageResult>,
    pub errors: Vec<StageError>,
}

impl ValidationReport {
    fn flag_mut(&mut self, stage: Stage) -> &mut bool {
        match stage {
            Stage::FormatCheck => &mut self.format_valid,
            Stage::KeyUnwrap => &mut self.key_unwrap_valid,
            Stage::SignatureCheck => &mut self.signature_valid,
            Stage::TimestampCheck => &mut self.timestamp_valid,
            Stage::NonceCheck => &mut self.nonce_valid,
            Stage::ApiKeyBindingCheck => &mut self.api_key_valid,
            Stage::PayloadDecrypt => &mut self.decryption_valid,
            Stage::ContentHashCheck => &mut self.content_hash_valid,
        }
    }

    pub const fn flag(&self, stage: Stage) -> bool {
        match stage {
            Stage::FormatCheck => self.format_valid,
            Stage::KeyUnwrap => self.key_unwrap_valid,
            Stage::SignatureCheck => self.signature_valid,
            Stage::TimestampCheck => self.timestamp_valid,
            Stage::NonceCheck => self.nonce_valid,
            Stage::ApiKeyBindingCheck => self.api_key_valid,
            Stage::PayloadDecrypt => self.decryption_valid,
            Stage::ContentHashCheck => self.content_hash_valid,
        }
    }

    pub(crate) fn pass(&mut self, stage: Stage) {
        *self.flag_mut(stage) = true;
        self.stages.push(StageResult {
            stage,
            outcome: StageOutcome::Passed,
        });
    }

    pub(crate) fn fail(&mut self, stage: Stage, message: impl Into<String>) {
        *self.flag_mut(stage) = false;
        self.stages.push(StageResult {
            stage,
            outcome: StageOutcome::Failed,
        });
        self.errors.push(StageError {
            stage,
            code: stage.code(),
            message: message.into(),
        });
    }

    pub(crate) fn skip(&mut self, stage: Stage) {
        self.stages.push(StageResult {
            stage,
            outcome: StageOutcome::Skipped,
        });
    }

    /// Mark every stage after `stage` as skipped.
    pub(crate) fn skip_after(&mut self, stage: Stage) {
        Stage::ALL
            .iter()
            .skip_while(|s| **s != stage)
            .skip(1)
            .for_each(|s| self.skip(*s));
    }

    /// Set `is_valid` once all stages have been recorded.
    pub(crate) fn finish(&mut self) {
        self.is_valid = self.errors.is_empty()
            && Stage::ALL.iter().all(|s| self.flag(*s))
            && self.stages.len() == Stage::ALL.len();
    }

    pub fn outcome(&self, stage: Stage) -> Option<StageOutcome> {
        self.stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| r.outcome)
    }

    /// The error reported first, which is what the HTTP API surfaces.
    pub fn first_error(&self) -> Option<&StageError> {
        self.errors.first()
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        self.errors.iter().map(|e| e.stage).collect()
    }
}

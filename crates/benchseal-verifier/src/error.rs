//! Infrastructure errors for the verifier.
//!
//! Stage failures never appear here: they are recorded in the
//! [`ValidationReport`](crate::pipeline::ValidationReport). Only failures of
//! the key store, the database or the task runtime reach callers.

use benchseal_crypto::CryptoError;

use crate::storage::DatabaseError;

/// Result type alias for verifier operations.
pub type Result<T> = std::result::Result<T, VerifierError>;

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    /// The private key store could not produce a key.
    #[error("Key store error: {0}")]
    KeyStore(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    /// A blocking verification task panicked or was cancelled.
    #[error("Task error: {0}")]
    Task(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key material could not be loaded at startup.
    #[error("Key loading error: {0}")]
    KeyLoad(#[from] CryptoError),
}

impl From<tokio::task::JoinError> for VerifierError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

impl From<sqlx::Error> for VerifierError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(DatabaseError::from(e))
    }
}

//! Crypto error types.

/// Errors from sealing, opening and verifying benchmark bundles.
///
/// Messages never carry key material or raw cryptographic bytes.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Integrity check failed: {0}")]
    CryptoIntegrity(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Replay detected: {0}")]
    Replay(String),

    #[error("API key binding mismatch")]
    Binding,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("Package expired at {0}")]
    PackageExpired(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Format(format!("invalid base64: {e}"))
    }
}

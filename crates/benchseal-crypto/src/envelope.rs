//! Online envelope format: sealing, structural validation and file storage.
//!
//! ```json
//! {
//!   "format_version": "1.0",
//!   "encrypted_session_key": "<b64 RSA-OAEP>",
//!   "encrypted_data": {"nonce": "<b64 12B>", "ciphertext": "<b64 AES-GCM>"},
//!   "signature_data": {"api_key_hash": "..", "log_hash": "..", "nonce": "<hex>", "timestamp": 0},
//!   "signature": "<b64 HMAC-SHA256>",
//!   "timestamp": "<RFC 3339>"
//! }
//! ```

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, SecondsFormat, Utc};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::canonical::to_canonical_string;
use crate::error::CryptoError;
use crate::hybrid::wrap_session_key;
use crate::kdf::{api_key_binding_hash, signing_key};
use crate::session::{EncryptedData, NONCE_SIZE, SessionKey};
use crate::signature::{SignatureData, generate_nonce, log_hash, sign};

/// AES-GCM tag length; every ciphertext is at least this long.
const TAG_LEN: usize = 16;

/// Encryption profile selected by `format_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeProfile {
    /// `"1.0"`: RSA-OAEP-SHA256 wrapped key, AES-256-GCM payload, HMAC-SHA256 signature.
    AeadV1,
}

impl EnvelopeProfile {
    /// Profile for a wire version tag. Unknown tags are rejected outright.
    pub fn from_version(version: &str) -> Result<Self, CryptoError> {
        match version {
            "1.0" => Ok(Self::AeadV1),
            other => Err(CryptoError::Format(format!(
                "unsupported format_version {other:?}"
            ))),
        }
    }

    pub const fn version(self) -> &'static str {
        match self {
            Self::AeadV1 => "1.0",
        }
    }
}

/// Base64 AEAD payload as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub nonce: String,
    pub ciphertext: String,
}

impl From<&EncryptedData> for EncryptedPayload {
    fn from(data: &EncryptedData) -> Self {
        Self {
            nonce: B64.encode(data.nonce),
            ciphertext: B64.encode(&data.ciphertext),
        }
    }
}

impl EncryptedPayload {
    /// Decode into raw nonce and ciphertext, checking lengths.
    pub fn decode(&self) -> Result<EncryptedData, CryptoError> {
        let nonce = B64
            .decode(&self.nonce)
            .map_err(|_| CryptoError::Format("encrypted_data.nonce is not base64".into()))?;
        let nonce: [u8; NONCE_SIZE] = nonce.try_into().map_err(|v: Vec<u8>| {
            CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: v.len(),
            }
        })?;
        let ciphertext = B64
            .decode(&self.ciphertext)
            .map_err(|_| CryptoError::Format("encrypted_data.ciphertext is not base64".into()))?;
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::Format("encrypted_data.ciphertext too short".into()));
        }
        Ok(EncryptedData { ciphertext, nonce })
    }
}

/// A sealed, signed benchmark result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub format_version: String,
    pub encrypted_session_key: String,
    pub encrypted_data: EncryptedPayload,
    pub signature_data: SignatureData,
    pub signature: String,
    /// Creation time, informational. The signed time is `signature_data.timestamp`.
    pub timestamp: String,
}

impl EncryptedEnvelope {
    /// Structural check of a raw JSON document.
    ///
    /// Only field presence, field types and the version tag are checked here.
    /// The version tag is checked first so an unsupported version never gets
    /// best-effort parsing. Encodings inside the fields are left to the stage
    /// that consumes them, so tampering surfaces as a key, signature or
    /// decryption failure rather than a format error.
    pub fn parse(value: &Value) -> Result<(EnvelopeProfile, Self), CryptoError> {
        let version = value
            .get("format_version")
            .ok_or_else(|| CryptoError::Format("missing field format_version".into()))?
            .as_str()
            .ok_or_else(|| CryptoError::Format("format_version must be a string".into()))?;
        let profile = EnvelopeProfile::from_version(version)?;

        let envelope: Self = serde_json::from_value(value.clone())
            .map_err(|e| CryptoError::Format(e.to_string()))?;
        Ok((profile, envelope))
    }

    /// Short human-readable summary for logs and CLI output.
    pub fn summary(&self) -> EnvelopeSummary {
        EnvelopeSummary {
            timestamp: self.signature_data.timestamp,
            log_hash_prefix: self.signature_data.log_hash.chars().take(16).collect(),
            nonce: self.signature_data.nonce.clone(),
        }
    }
}

/// What `benchseal seal` prints after storing an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvelopeSummary {
    pub timestamp: i64,
    pub log_hash_prefix: String,
    pub nonce: String,
}

/// Seal `payload` for the server holding the private half of `public_key`.
///
/// The plaintext is the canonical serialization of `payload`, so the content
/// hash can be recomputed from the decrypted bytes alone.
pub fn seal_envelope(
    payload: &Value,
    api_key: &str,
    public_key: &RsaPublicKey,
    now: DateTime<Utc>,
) -> Result<EncryptedEnvelope, CryptoError> {
    if api_key.is_empty() {
        return Err(CryptoError::Format("API key must not be empty".into()));
    }

    let plaintext = to_canonical_string(payload)?;
    let session_key = SessionKey::generate();

    let encrypted = session_key.encrypt(plaintext.as_bytes())?;
    let encrypted_session_key = wrap_session_key(&session_key, public_key)?;

    let timestamp = now.timestamp();
    let signature_data = SignatureData::build(
        &log_hash(payload)?,
        timestamp,
        &generate_nonce(),
        &api_key_binding_hash(api_key, &session_key)?,
    );
    let key = signing_key(&session_key, timestamp)?;
    let signature = sign(key.as_slice(), &signature_data)?;

    debug!(
        plaintext_len = plaintext.len(),
        ciphertext_len = encrypted.ciphertext.len(),
        timestamp,
        "Envelope sealed"
    );

    Ok(EncryptedEnvelope {
        format_version: EnvelopeProfile::AeadV1.version().to_string(),
        encrypted_session_key,
        encrypted_data: EncryptedPayload::from(&encrypted),
        signature_data,
        signature,
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

/// Store an envelope as pretty JSON for later upload.
pub fn save_envelope(path: &Path, envelope: &EncryptedEnvelope) -> Result<(), CryptoError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(envelope)?)?;
    Ok(())
}

/// Load and structurally validate a stored envelope.
pub fn load_envelope(path: &Path) -> Result<EncryptedEnvelope, CryptoError> {
    let content = std::fs::read_to_string(path)?;
    let value: Value =
        serde_json::from_str(&content).map_err(|e| CryptoError::Format(e.to_string()))?;
    EncryptedEnvelope::parse(&value).map(|(_, envelope)| envelope)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hybrid::{test_key_pair, unwrap_session_key};
    use crate::signature::verify;
    use serde_json::json;

    fn sealed() -> EncryptedEnvelope {
        let (_, public) = test_key_pair();
        seal_envelope(&json!({"a": 1}), "k1", &public, Utc::now()).unwrap()
    }

    #[test]
    fn sealed_envelope_opens_with_private_key() {
        let (private, _) = test_key_pair();
        let envelope = sealed();

        let session = unwrap_session_key(&envelope.encrypted_session_key, &private).unwrap();
        let data = envelope.encrypted_data.decode().unwrap();
        let plaintext = session.decrypt(&data.ciphertext, &data.nonce).unwrap();
        assert_eq!(plaintext, br#"{"a":1}"#);

        let key = signing_key(&session, envelope.signature_data.timestamp).unwrap();
        verify(key.as_slice(), &envelope.signature_data, &envelope.signature).unwrap();

        let binding = api_key_binding_hash("k1", &session).unwrap();
        assert_eq!(envelope.signature_data.api_key_hash_bytes().unwrap(), binding);
    }

    #[test]
    fn wire_shape_has_expected_fields() {
        let value = serde_json::to_value(sealed()).unwrap();
        for field in [
            "format_version",
            "encrypted_session_key",
            "encrypted_data",
            "signature_data",
            "signature",
            "timestamp",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["format_version"], "1.0");
        assert!(value["signature_data"]["timestamp"].is_i64());
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn parse_accepts_sealed_envelope() {
        let envelope = sealed();
        let value = serde_json::to_value(&envelope).unwrap();
        let (profile, parsed) = EncryptedEnvelope::parse(&value).unwrap();
        assert_eq!(profile, EnvelopeProfile::AeadV1);
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn parse_rejects_unsupported_version() {
        let mut value = serde_json::to_value(sealed()).unwrap();
        value["format_version"] = json!("2.0");
        let err = EncryptedEnvelope::parse(&value).unwrap_err();
        assert!(err.to_string().contains("unsupported format_version"));
    }

    #[test]
    fn parse_rejects_missing_fields_and_bad_types() {
        let mut value = serde_json::to_value(sealed()).unwrap();
        value.as_object_mut().unwrap().remove("signature");
        assert!(matches!(EncryptedEnvelope::parse(&value), Err(CryptoError::Format(_))));

        let mut value = serde_json::to_value(sealed()).unwrap();
        value["signature_data"]["timestamp"] = json!("yesterday");
        assert!(matches!(EncryptedEnvelope::parse(&value), Err(CryptoError::Format(_))));

        let mut value = serde_json::to_value(sealed()).unwrap();
        value.as_object_mut().unwrap().remove("format_version");
        assert!(matches!(EncryptedEnvelope::parse(&value), Err(CryptoError::Format(_))));
    }

    #[test]
    fn parse_leaves_field_encodings_to_later_checks() {
        let mut value = serde_json::to_value(sealed()).unwrap();
        value["encrypted_data"]["ciphertext"] = json!("%%%");
        value["signature_data"]["nonce"] = json!("g".repeat(32));
        value["signature_data"]["log_hash"] = json!("*");
        let (_, parsed) = EncryptedEnvelope::parse(&value).unwrap();

        assert!(parsed.encrypted_data.decode().is_err());
        assert!(parsed.signature_data.log_hash_bytes().is_err());
    }

    #[test]
    fn seal_rejects_empty_api_key() {
        let (_, public) = test_key_pair();
        assert!(seal_envelope(&json!({}), "", &public, Utc::now()).is_err());
    }

    #[test]
    fn each_seal_uses_fresh_nonce_and_key() {
        let a = sealed();
        let b = sealed();
        assert_ne!(a.signature_data.nonce, b.signature_data.nonce);
        assert_ne!(a.encrypted_session_key, b.encrypted_session_key);
        assert_eq!(a.signature_data.log_hash, b.signature_data.log_hash);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending").join("result.json");
        let envelope = sealed();

        save_envelope(&path, &envelope).unwrap();
        assert_eq!(load_envelope(&path).unwrap(), envelope);
    }

    #[test]
    fn summary_truncates_hash() {
        let envelope = sealed();
        let summary = envelope.summary();
        assert_eq!(summary.log_hash_prefix.len(), 16);
        assert_eq!(summary.nonce, envelope.signature_data.nonce);
    }
}

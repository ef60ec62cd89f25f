//! Signature data construction, HMAC signing and constant-time verification.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::canonical::{canonical_bytes, canonical_hash};
use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in a signature nonce (hex-encoded on the wire).
pub const SIGNATURE_NONCE_LEN: usize = 16;

/// The signed part of an envelope.
///
/// The signature covers the canonical JSON of this struct, so field names
/// are part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureData {
    /// Base64 API-key binding hash.
    pub api_key_hash: String,
    /// Base64 SHA-256 of the canonical plaintext payload.
    pub log_hash: String,
    /// 32 lowercase hex characters.
    pub nonce: String,
    /// Unix seconds at signing time.
    pub timestamp: i64,
}

impl SignatureData {
    /// Assemble signature data from raw hashes.
    pub fn build(
        log_hash: &[u8; 32],
        timestamp: i64,
        nonce: &[u8; SIGNATURE_NONCE_LEN],
        api_key_hash: &[u8; 32],
    ) -> Self {
        Self {
            api_key_hash: B64.encode(api_key_hash),
            log_hash: B64.encode(log_hash),
            nonce: hex::encode(nonce),
            timestamp,
        }
    }

    /// The exact bytes the HMAC covers.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        canonical_bytes(self)
    }

    /// Decode and length-check `log_hash`.
    pub fn log_hash_bytes(&self) -> Result<[u8; 32], CryptoError> {
        decode_hash("log_hash", &self.log_hash)
    }

    /// Decode and length-check `api_key_hash`.
    pub fn api_key_hash_bytes(&self) -> Result<[u8; 32], CryptoError> {
        decode_hash("api_key_hash", &self.api_key_hash)
    }
}

fn decode_hash(field: &str, value: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = B64
        .decode(value)
        .map_err(|_| CryptoError::Format(format!("signature_data.{field} is not base64")))?;
    bytes.try_into().map_err(|v: Vec<u8>| {
        CryptoError::Format(format!(
            "signature_data.{field} must be 32 bytes, got {}",
            v.len()
        ))
    })
}

/// Generate a fresh signature nonce.
pub fn generate_nonce() -> [u8; SIGNATURE_NONCE_LEN] {
    let mut nonce = [0u8; SIGNATURE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// SHA-256 over the canonical serialization of a plaintext payload.
pub fn log_hash(payload: &Value) -> Result<[u8; 32], CryptoError> {
    canonical_hash(payload)
}

fn mac_over(signing_key: &[u8], data: &SignatureData) -> Result<HmacSha256, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(signing_key)
        .map_err(|e| CryptoError::Signature(e.to_string()))?;
    mac.update(&data.canonical_bytes()?);
    Ok(mac)
}

/// HMAC-SHA256 over the canonical signature data, base64-encoded.
pub fn sign(signing_key: &[u8], data: &SignatureData) -> Result<String, CryptoError> {
    let tag = mac_over(signing_key, data)?.finalize().into_bytes();
    Ok(B64.encode(tag))
}

/// Verify a base64 signature in constant time.
pub fn verify(signing_key: &[u8], data: &SignatureData, signature: &str) -> Result<(), CryptoError> {
    let tag = B64
        .decode(signature)
        .map_err(|_| CryptoError::Signature("signature is not base64".into()))?;
    mac_over(signing_key, data)?
        .verify_slice(&tag)
        .map_err(|_| CryptoError::Signature("HMAC mismatch".into()))
}

/// Constant-time byte comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

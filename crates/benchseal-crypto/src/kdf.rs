//! HKDF-SHA256 key derivation hierarchy.
//!
//! One primitive ([`derive`]) backs three disjoint contexts. Each context
//! owns its (salt, info) pair and no two contexts share one:
//!
//! | context | ikm | salt | info |
//! |---|---|---|---|
//! | signing key | session key | `SHA-256(timestamp as decimal)` | `benchmark_log_signature` |
//! | API-key binding | `api_key ‖ session key` | `deepstress_api_binding` | `api_key_binding` |
//! | offline dataset key | session key (any length) | 16 random bytes, stored | `dataset_encryption` |
//!
//! Only the dataset salt is random. The signing salt is recomputed from the
//! signed timestamp and the binding salt is a fixed label, both required by
//! the 1.0 envelope wire format; per-envelope uniqueness of those keys comes
//! from the random session key they are derived from.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::session::SessionKey;

/// Minimum accepted input key material length.
pub const MIN_MASTER_KEY_LEN: usize = 16;

/// Output length of every derived key.
pub const DERIVED_KEY_LEN: usize = 32;

/// HKDF info for the HMAC signing key.
pub const SIGNING_INFO: &[u8] = b"benchmark_log_signature";

/// HKDF salt for API-key binding.
pub const BINDING_SALT: &[u8] = b"deepstress_api_binding";

/// HKDF info for API-key binding.
pub const BINDING_INFO: &[u8] = b"api_key_binding";

/// HKDF info for offline dataset keys, recorded in the package.
pub const DATASET_INFO: &str = "dataset_encryption";

/// Salt length for offline dataset keys.
pub const DATASET_SALT_LEN: usize = 16;

/// RFC 5869 HKDF-SHA256 extract-then-expand.
///
/// Fails with [`CryptoError::KeyDerivation`] when the master key is shorter
/// than [`MIN_MASTER_KEY_LEN`], when salt or info is empty, or when `length`
/// is zero or above `255 * 32`.
pub fn derive(
    master_key: &[u8],
    salt: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if master_key.len() < MIN_MASTER_KEY_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "master key too short: {} bytes (minimum {MIN_MASTER_KEY_LEN})",
            master_key.len()
        )));
    }
    if salt.is_empty() {
        return Err(CryptoError::KeyDerivation("salt must not be empty".into()));
    }
    if info.is_empty() {
        return Err(CryptoError::KeyDerivation("info must not be empty".into()));
    }
    if length == 0 {
        return Err(CryptoError::KeyDerivation("output length must be non-zero".into()));
    }

    let hk = Hkdf::<Sha256>::new(Some(salt), master_key);
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// [`derive`] with a fixed 32-byte output.
pub fn derive_key(
    master_key: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>, CryptoError> {
    let okm = derive(master_key, salt, info, DERIVED_KEY_LEN)?;
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    key.copy_from_slice(&okm);
    Ok(key)
}

/// Salt for the signing key: SHA-256 of the decimal timestamp string.
///
/// Deterministic so the verifier can recompute it from `signature_data`.
pub fn signing_salt(timestamp: i64) -> [u8; 32] {
    Sha256::digest(timestamp.to_string().as_bytes()).into()
}

/// Derive the HMAC key that signs an envelope's `signature_data`.
pub fn signing_key(
    session_key: &SessionKey,
    timestamp: i64,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>, CryptoError> {
    derive_key(session_key.as_bytes(), &signing_salt(timestamp), SIGNING_INFO)
}

/// Compute the `api_key_hash` binding an API key to one session key.
///
/// `SHA-256(HKDF(api_key ‖ session_key))`. The API key itself is never stored.
pub fn api_key_binding_hash(
    api_key: &str,
    session_key: &SessionKey,
) -> Result<[u8; 32], CryptoError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(api_key.len() + session_key.as_bytes().len()));
    ikm.extend_from_slice(api_key.as_bytes());
    ikm.extend_from_slice(session_key.as_bytes());

    let derived = derive_key(&ikm, BINDING_SALT, BINDING_INFO)?;
    Ok(Sha256::digest(derived.as_slice()).into())
}

/// Derive the AES-256 key for a v4.0 offline dataset.
///
/// Accepts session keys of any length of at least [`MIN_MASTER_KEY_LEN`].
pub fn dataset_key(
    session_key: &[u8],
    salt: &[u8],
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>, CryptoError> {
    derive_key(session_key, salt, DATASET_INFO.as_bytes())
}

//! `BenchSeal` sealing library
//!
//! Seals benchmark results on an untrusted client so that only the server
//! holding the RSA private key can open them, and so that any modification,
//! replay or cross-key reuse is detectable.
//!
//! ## Crypto primitives
//!
//! - **Key wrapping**: RSA-OAEP (SHA-256, MGF1-SHA-256) of a fresh 32-byte session key
//! - **Payload**: AES-256-GCM, 12-byte random nonce
//! - **Derivation**: HKDF-SHA256 with one (salt, info) pair per context
//! - **Signature**: HMAC-SHA256 over canonical JSON signature data
//! - **Offline packages**: PBKDF2-HMAC-SHA256 and AES-256-CBC/PKCS#7

pub mod canonical;
pub mod envelope;
pub mod error;
pub mod hybrid;
pub mod kdf;
pub mod obfuscation;
pub mod offline;
pub mod session;
pub mod signature;

pub use canonical::{canonical_bytes, canonical_hash, to_canonical_string};
pub use envelope::{
    EncryptedEnvelope, EncryptedPayload, EnvelopeProfile, EnvelopeSummary, load_envelope,
    save_envelope, seal_envelope,
};
pub use error::CryptoError;
#[cfg(any(test, feature = "test-utils"))]
pub use hybrid::test_key_pair;
pub use hybrid::{
    generate_private_key, key_id, load_private_key, private_key_from_pem, public_key_from_pem,
    public_key_to_pem, save_private_key, unwrap_session_key, wrap_session_key,
};
pub use obfuscation::{
    EmbeddedKeyFragments, FragmentCodec, ObfuscatedKeyFragment, PemPublicKey, PublicKeySource,
};
pub use offline::{DatasetId, DatasetProfile, OfflinePackage, OfflinePackageCodec, OpenedPackage};
pub use rsa::{RsaPrivateKey, RsaPublicKey};
pub use session::{EncryptedData, NONCE_SIZE, SessionKey, generate_session_key};
pub use signature::{SignatureData, constant_time_eq};

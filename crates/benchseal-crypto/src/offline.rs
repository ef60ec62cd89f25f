//! Versioned offline package codec.
//!
//! A package has three layers:
//!
//! 1. `encrypted_private_key`: an RSA private key PEM under AES-256-CBC/PKCS#7,
//!    keyed by PBKDF2-HMAC-SHA256 of the API key (100 000 iterations).
//! 2. `dataset.encrypted_session_key`: the session key wrapped with RSA-OAEP.
//! 3. `dataset.encrypted_data`: the dataset itself, encrypted according to
//!    the [`DatasetProfile`] named by `metadata.package_format`.
//!
//! Writers only produce format `"4.0"`. Formats `"1.0"`..`"3.0"` are readable.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::canonical::to_canonical_string;
use crate::error::CryptoError;
use crate::hybrid::{private_key_from_pem, private_key_to_pem, unwrap_key_bytes, wrap_key_bytes};
use crate::kdf::{DATASET_INFO, DATASET_SALT_LEN, dataset_key};
use crate::session::SESSION_KEY_LEN;
use crate::signature::constant_time_eq;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Format written by [`OfflinePackageCodec::pack`].
pub const PACKAGE_FORMAT_V4: &str = "4.0";

/// Iterations for the private key wrapping KDF.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length for the private key wrapping KDF.
pub const PRIVATE_KEY_SALT_LEN: usize = 32;

/// AES-CBC IV length.
pub const CBC_IV_LEN: usize = 16;

/// `encrypted_data.algorithm` for every known profile.
pub const DATASET_ALGORITHM: &str = "AES-256-CBC-PKCS7";

/// `key_derivation.method` for format 4.0.
pub const KDF_METHOD: &str = "HKDF-SHA256";

/// Default lifetime of a freshly packed package.
pub const DEFAULT_VALIDITY_DAYS: i64 = 30;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Dataset decryption profile selected by `package_format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetProfile {
    /// `"4.0"`: HKDF-SHA256 derived AES-256 key with recorded salt and info.
    HkdfCbcV4,
    /// `"1.0"`, `"2.0"`, `"3.0"`: session key bytes used directly. Read-only.
    LegacyDirect,
}

impl DatasetProfile {
    pub fn from_package_format(format: &str) -> Result<Self, CryptoError> {
        match format {
            PACKAGE_FORMAT_V4 => Ok(Self::HkdfCbcV4),
            "1.0" | "2.0" | "3.0" => Ok(Self::LegacyDirect),
            other => Err(CryptoError::Format(format!(
                "unsupported package_format {other:?}"
            ))),
        }
    }
}

/// Dataset ids appear as numbers in older packages and strings in newer ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasetId {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub package_format: String,
    pub dataset_id: DatasetId,
    pub created_at: String,
    pub expires_at: String,
}

impl PackageMetadata {
    /// Parse `expires_at`, accepting both `Z`-suffixed and RFC 3339 forms.
    pub fn expires_at(&self) -> Result<DateTime<Utc>, CryptoError> {
        parse_package_date(&self.expires_at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> Result<bool, CryptoError> {
        Ok(self.expires_at()? < now)
    }
}

fn parse_package_date(value: &str) -> Result<DateTime<Utc>, CryptoError> {
    NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|_| CryptoError::Format(format!("invalid package date {value:?}")))
}

/// PBKDF2 + AES-CBC wrapped private key PEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPrivateKey {
    pub salt: String,
    pub iv: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDerivationInfo {
    pub method: String,
    pub salt: String,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetCipherBlock {
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_derivation: Option<KeyDerivationInfo>,
    pub iv: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetBlock {
    pub encrypted_session_key: String,
    pub encrypted_data: DatasetCipherBlock,
    /// Milliseconds since the Unix epoch, as a string.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflinePackage {
    pub metadata: PackageMetadata,
    pub encrypted_private_key: EncryptedPrivateKey,
    pub dataset: DatasetBlock,
}

/// Result of opening a package.
#[derive(Debug, Clone)]
pub struct OpenedPackage {
    pub dataset: Value,
    pub profile: DatasetProfile,
    pub dataset_id: DatasetId,
    pub signature_checked: bool,
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: SESSION_KEY_LEN,
            actual: key.len(),
        }
    })?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != CBC_IV_LEN {
        return Err(CryptoError::InvalidNonceLength {
            expected: CBC_IV_LEN,
            actual: iv.len(),
        });
    }
    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: SESSION_KEY_LEN,
            actual: key.len(),
        }
    })?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::CryptoIntegrity("AES-CBC padding check failed".into()))
}

fn pbkdf2_key(api_key: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(api_key.as_bytes(), salt, PBKDF2_ITERATIONS, key.as_mut_slice());
    key
}

/// Wrap a private key PEM under a key derived from `api_key`.
pub fn encrypt_private_key(
    private_key: &RsaPrivateKey,
    api_key: &str,
) -> Result<EncryptedPrivateKey, CryptoError> {
    let salt = random_bytes::<PRIVATE_KEY_SALT_LEN>();
    let iv = random_bytes::<CBC_IV_LEN>();
    let key = pbkdf2_key(api_key, &salt);
    let pem = private_key_to_pem(private_key)?;
    let data = cbc_encrypt(key.as_slice(), &iv, pem.as_bytes())?;
    Ok(EncryptedPrivateKey {
        salt: B64.encode(salt),
        iv: B64.encode(iv),
        data: B64.encode(data),
    })
}

/// Inverse of [`encrypt_private_key`]. A wrong API key fails the padding check
/// or yields an unparseable PEM; both surface as errors.
pub fn decrypt_private_key(
    wrapped: &EncryptedPrivateKey,
    api_key: &str,
) -> Result<RsaPrivateKey, CryptoError> {
    let salt = B64.decode(&wrapped.salt)?;
    let iv = B64.decode(&wrapped.iv)?;
    let data = B64.decode(&wrapped.data)?;
    let key = pbkdf2_key(api_key, &salt);
    let pem = Zeroizing::new(cbc_decrypt(key.as_slice(), &iv, &data)?);
    let pem = std::str::from_utf8(&pem)
        .map_err(|_| CryptoError::CryptoIntegrity("private key did not decrypt to PEM".into()))?;
    private_key_from_pem(pem)
        .map_err(|_| CryptoError::CryptoIntegrity("private key did not decrypt to PEM".into()))
}

/// `hex(SHA-256(canonical(dataset) ‖ timestamp ‖ api_key))`.
pub fn user_signature(dataset: &Value, timestamp: &str, api_key: &str) -> Result<String, CryptoError> {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_string(dataset)?.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(api_key.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Encrypt a dataset for format 4.0.
pub fn encrypt_dataset_v4(
    dataset: &Value,
    session_key: &[u8],
) -> Result<DatasetCipherBlock, CryptoError> {
    let salt = random_bytes::<DATASET_SALT_LEN>();
    let iv = random_bytes::<CBC_IV_LEN>();
    let key = dataset_key(session_key, &salt)?;
    let plaintext = to_canonical_string(dataset)?;
    let data = cbc_encrypt(key.as_slice(), &iv, plaintext.as_bytes())?;
    Ok(DatasetCipherBlock {
        algorithm: DATASET_ALGORITHM.to_string(),
        key_derivation: Some(KeyDerivationInfo {
            method: KDF_METHOD.to_string(),
            salt: B64.encode(salt),
            info: DATASET_INFO.to_string(),
        }),
        iv: B64.encode(iv),
        data: B64.encode(data),
    })
}

/// Decrypt a dataset block according to `profile`.
pub fn decrypt_dataset(
    block: &DatasetCipherBlock,
    session_key: &[u8],
    profile: DatasetProfile,
) -> Result<Value, CryptoError> {
    if block.algorithm != DATASET_ALGORITHM {
        return Err(CryptoError::Format(format!(
            "unsupported dataset algorithm {:?}",
            block.algorithm
        )));
    }
    let iv = B64.decode(&block.iv)?;
    let data = B64.decode(&block.data)?;

    let plaintext = match profile {
        DatasetProfile::HkdfCbcV4 => {
            let kd = block.key_derivation.as_ref().ok_or_else(|| {
                CryptoError::Format("format 4.0 requires encrypted_data.key_derivation".into())
            })?;
            if kd.method != KDF_METHOD {
                return Err(CryptoError::Format(format!(
                    "unsupported key derivation method {:?}",
                    kd.method
                )));
            }
            let salt = B64.decode(&kd.salt)?;
            let key = crate::kdf::derive_key(session_key, &salt, kd.info.as_bytes())?;
            debug!(session_key_len = session_key.len(), "Dataset key derived via HKDF");
            cbc_decrypt(key.as_slice(), &iv, &data)?
        }
        DatasetProfile::LegacyDirect => {
            if session_key.len() != SESSION_KEY_LEN {
                return Err(CryptoError::InvalidKeyLength {
                    expected: SESSION_KEY_LEN,
                    actual: session_key.len(),
                });
            }
            cbc_decrypt(session_key, &iv, &data)?
        }
    };

    serde_json::from_slice(&plaintext)
        .map_err(|e| CryptoError::Serialization(format!("dataset is not JSON: {e}")))
}

/// Builds and opens offline packages.
#[derive(Debug, Clone)]
pub struct OfflinePackageCodec {
    validity: TimeDelta,
}

impl Default for OfflinePackageCodec {
    fn default() -> Self {
        Self::new(TimeDelta::days(DEFAULT_VALIDITY_DAYS))
    }
}

impl OfflinePackageCodec {
    pub const fn new(validity: TimeDelta) -> Self {
        Self { validity }
    }

    /// Build a format 4.0 package for `dataset`.
    ///
    /// `private_key` is embedded under the API key so the holder of that key
    /// can open the package without contacting the server.
    pub fn pack(
        &self,
        dataset: &Value,
        dataset_id: DatasetId,
        api_key: &str,
        private_key: &RsaPrivateKey,
        now: DateTime<Utc>,
    ) -> Result<OfflinePackage, CryptoError> {
        if api_key.is_empty() {
            return Err(CryptoError::Format("API key must not be empty".into()));
        }
        let public_key = RsaPublicKey::from(private_key);
        let session_key = Zeroizing::new(random_bytes::<SESSION_KEY_LEN>());

        let encrypted_private_key = encrypt_private_key(private_key, api_key)?;
        let encrypted_session_key = wrap_key_bytes(session_key.as_slice(), &public_key)?;
        let encrypted_data = encrypt_dataset_v4(dataset, session_key.as_slice())?;

        let timestamp = now.timestamp_millis().to_string();
        let signature = user_signature(dataset, &timestamp, api_key)?;

        info!(dataset_id = %dataset_id, format = PACKAGE_FORMAT_V4, "Offline package created");

        Ok(OfflinePackage {
            metadata: PackageMetadata {
                package_format: PACKAGE_FORMAT_V4.to_string(),
                dataset_id,
                created_at: now.format(DATE_FORMAT).to_string(),
                expires_at: (now + self.validity).format(DATE_FORMAT).to_string(),
            },
            encrypted_private_key,
            dataset: DatasetBlock {
                encrypted_session_key,
                encrypted_data,
                timestamp,
                user_signature: Some(signature),
            },
        })
    }

    /// Open a package with the API key it was packed for.
    pub fn unpack(
        &self,
        package: &OfflinePackage,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<OpenedPackage, CryptoError> {
        let profile = Self::check_metadata(package, now)?;
        let private_key = decrypt_private_key(&package.encrypted_private_key, api_key)?;
        Self::open(package, profile, &private_key, Some(api_key))
    }

    /// Open a package with a private key held out of band.
    ///
    /// `user_signature` is only checked when `api_key` is given.
    pub fn open_with_private_key(
        &self,
        package: &OfflinePackage,
        private_key: &RsaPrivateKey,
        api_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OpenedPackage, CryptoError> {
        let profile = Self::check_metadata(package, now)?;
        Self::open(package, profile, private_key, api_key)
    }

    fn check_metadata(
        package: &OfflinePackage,
        now: DateTime<Utc>,
    ) -> Result<DatasetProfile, CryptoError> {
        let profile = DatasetProfile::from_package_format(&package.metadata.package_format)?;
        if package.metadata.is_expired(now)? {
            return Err(CryptoError::PackageExpired(package.metadata.expires_at.clone()));
        }
        Ok(profile)
    }

    fn open(
        package: &OfflinePackage,
        profile: DatasetProfile,
        private_key: &RsaPrivateKey,
        api_key: Option<&str>,
    ) -> Result<OpenedPackage, CryptoError> {
        let session_key = unwrap_key_bytes(&package.dataset.encrypted_session_key, private_key)?;
        let dataset = decrypt_dataset(&package.dataset.encrypted_data, &session_key, profile)?;

        let signature_checked = match (api_key, &package.dataset.user_signature) {
            (Some(api_key), Some(expected)) => {
                let actual = user_signature(&dataset, &package.dataset.timestamp, api_key)?;
                if !constant_time_eq(actual.as_bytes(), expected.as_bytes()) {
                    return Err(CryptoError::Signature("user_signature mismatch".into()));
                }
                true
            }
            _ => false,
        };

        info!(
            dataset_id = %package.metadata.dataset_id,
            format = %package.metadata.package_format,
            signature_checked,
            "Offline package opened"
        );

        Ok(OpenedPackage {
            dataset,
            profile,
            dataset_id: package.metadata.dataset_id.clone(),
            signature_checked,
        })
    }
}

/// Read an offline package from disk.
pub fn load_package(path: &std::path::Path) -> Result<OfflinePackage, CryptoError> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| CryptoError::Format(e.to_string()))
}

/// Write an offline package to disk as pretty JSON.
pub fn save_package(path: &std::path::Path, package: &OfflinePackage) -> Result<(), CryptoError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(package)?)?;
    Ok(())
}

//! Ephemeral session keys and AEAD payload sealing.
//!
//! Every envelope is sealed under a fresh 32-byte session key with
//! AES-256-GCM and a random 12-byte nonce. The session key itself travels
//! wrapped under the server's RSA public key (see [`crate::hybrid`]).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Session key size in bytes (AES-256).
pub const SESSION_KEY_LEN: usize = 32;

/// Nonce size for AES-256-GCM.
pub const NONCE_SIZE: usize = 12;

/// A 32-byte symmetric session key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Encrypted payload with the nonce needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// AES-256-GCM ciphertext (includes the 16-byte auth tag).
    pub ciphertext: Vec<u8>,
    /// 12-byte nonce used for this encryption.
    pub nonce: [u8; NONCE_SIZE],
}

impl SessionKey {
    /// Generate a new key from the OS CSPRNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    /// Generate a new key from the given CSPRNG.
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Reconstruct from raw key bytes, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SESSION_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: SESSION_KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; SESSION_KEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Raw key bytes. Handle with care.
    pub const fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    /// Encrypt plaintext under this key with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedData, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::CryptoIntegrity("AES-GCM encryption failed".into()))?;

        Ok(EncryptedData { ciphertext, nonce })
    }

    /// Decrypt ciphertext using the provided nonce.
    ///
    /// A tag mismatch is reported as [`CryptoError::CryptoIntegrity`].
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: nonce.len(),
            });
        }
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::CryptoIntegrity("AES-GCM tag mismatch".into()))
    }
}

/// Generate a fresh session key from the OS CSPRNG.
pub fn generate_session_key() -> SessionKey {
    SessionKey::generate()
}

/// Seal `plaintext` under `session_key`.
pub fn encrypt_payload(
    session_key: &SessionKey,
    plaintext: &[u8],
) -> Result<EncryptedData, CryptoError> {
    session_key.encrypt(plaintext)
}

/// Open a payload sealed by [`encrypt_payload`].
pub fn decrypt_payload(
    session_key: &SessionKey,
    data: &EncryptedData,
) -> Result<Vec<u8>, CryptoError> {
    session_key.decrypt(&data.ciphertext, &data.nonce)
}

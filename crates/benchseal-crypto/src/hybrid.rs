//! RSA-OAEP session key wrapping and RSA key file handling.
//!
//! Wrapping uses OAEP with SHA-256 for both the label hash and MGF1, and an
//! empty label. Unwrapping is strict: there is no fallback to another padding
//! scheme, so any mismatch surfaces as [`CryptoError::CryptoIntegrity`].

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::session::SessionKey;

/// Default modulus size for generated server keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Wrap arbitrary key bytes under `public_key`, base64-encoded.
pub fn wrap_key_bytes(key: &[u8], public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    let ciphertext = public_key
        .encrypt(&mut OsRng, oaep(), key)
        .map_err(|e| CryptoError::CryptoIntegrity(format!("RSA-OAEP wrap failed: {e}")))?;
    Ok(B64.encode(ciphertext))
}

/// Unwrap base64 key bytes with `private_key`.
pub fn unwrap_key_bytes(
    wrapped: &str,
    private_key: &RsaPrivateKey,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let ciphertext = B64.decode(wrapped)?;
    private_key
        .decrypt(oaep(), &ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::CryptoIntegrity("RSA-OAEP unwrap failed".into()))
}

/// Wrap a session key under the server public key.
pub fn wrap_session_key(
    session_key: &SessionKey,
    public_key: &RsaPublicKey,
) -> Result<String, CryptoError> {
    wrap_key_bytes(session_key.as_bytes(), public_key)
}

/// Strict inverse of [`wrap_session_key`]. The unwrapped key must be 32 bytes.
pub fn unwrap_session_key(
    wrapped: &str,
    private_key: &RsaPrivateKey,
) -> Result<SessionKey, CryptoError> {
    let bytes = unwrap_key_bytes(wrapped, private_key)?;
    SessionKey::from_slice(&bytes)
        .map_err(|e| CryptoError::CryptoIntegrity(format!("unwrapped key rejected: {e}")))
}

/// Generate a new RSA private key.
pub fn generate_private_key(bits: usize) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CryptoError::KeyDerivation(format!("RSA key generation failed: {e}")))
}

/// Parse a SubjectPublicKeyInfo PEM (`BEGIN PUBLIC KEY`).
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| CryptoError::Format(format!("invalid public key PEM: {e}")))
}

/// Parse a PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`) PEM.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    let pem = pem.trim();
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|_| CryptoError::Format("invalid private key PEM".into()))
}

/// Encode a public key as SubjectPublicKeyInfo PEM.
pub fn public_key_to_pem(public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Serialization(e.to_string()))
}

/// Encode a private key as PKCS#8 PEM.
pub fn private_key_to_pem(private_key: &RsaPrivateKey) -> Result<Zeroizing<String>, CryptoError> {
    private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Serialization(e.to_string()))
}

/// Short key id: first 16 hex chars of SHA-256 over the SPKI DER encoding.
pub fn key_id(public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| CryptoError::Serialization(e.to_string()))?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(hex::encode(&digest[..8]))
}

/// Save a private key as PKCS#8 PEM with owner-only permissions.
pub fn save_private_key(private_key: &RsaPrivateKey, path: &Path) -> Result<(), CryptoError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let pem = private_key_to_pem(private_key)?;
    std::fs::write(path, pem.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Load a private key PEM file.
///
/// On Unix, refuses files readable by group or others.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, CryptoError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(CryptoError::IoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("Private key file has insecure permissions: {mode:o} (expected 600)"),
            )));
        }
    }

    let pem = Zeroizing::new(std::fs::read_to_string(path)?);
    private_key_from_pem(&pem)
}

/// Shared 2048-bit key pair for tests; RSA generation is slow.
#[cfg(any(test, feature = "test-utils"))]
pub fn test_key_pair() -> (RsaPrivateKey, RsaPublicKey) {
    use std::sync::OnceLock;

    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    let private = KEY
        .get_or_init(|| {
            #[allow(clippy::expect_used)]
            RsaPrivateKey::new(&mut OsRng, DEFAULT_KEY_BITS).expect("test RSA key generation")
        })
        .clone();
    let public = RsaPublicKey::from(&private);
    (private, public)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::generate_session_key;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let (private, public) = test_key_pair();
        let session = generate_session_key();

        let wrapped = wrap_session_key(&session, &public).unwrap();
        let unwrapped = unwrap_session_key(&wrapped, &private).unwrap();

        assert_eq!(unwrapped.as_bytes(), session.as_bytes());
    }

    #[test]
    fn wrapping_is_randomized() {
        let (_, public) = test_key_pair();
        let session = generate_session_key();
        let a = wrap_session_key(&session, &public).unwrap();
        let b = wrap_session_key(&session, &public).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unwrap_with_tampered_ciphertext_fails() {
        let (private, public) = test_key_pair();
        let wrapped = wrap_session_key(&generate_session_key(), &public).unwrap();

        let mut raw = B64.decode(&wrapped).unwrap();
        raw[10] ^= 0x01;
        let tampered = B64.encode(raw);

        assert!(matches!(
            unwrap_session_key(&tampered, &private),
            Err(CryptoError::CryptoIntegrity(_))
        ));
    }

    #[test]
    fn unwrap_rejects_invalid_base64() {
        let (private, _) = test_key_pair();
        assert!(matches!(
            unwrap_session_key("not base64!!", &private),
            Err(CryptoError::Format(_))
        ));
    }

    #[test]
    fn unwrap_session_key_rejects_wrong_length() {
        let (private, public) = test_key_pair();
        let wrapped = wrap_key_bytes(&[1u8; 54], &public).unwrap();
        assert!(matches!(
            unwrap_session_key(&wrapped, &private),
            Err(CryptoError::CryptoIntegrity(_))
        ));
        assert_eq!(unwrap_key_bytes(&wrapped, &private).unwrap().len(), 54);
    }

    #[test]
    fn pem_roundtrip() {
        let (private, public) = test_key_pair();

        let public_pem = public_key_to_pem(&public).unwrap();
        assert!(public_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(public_key_from_pem(&public_pem).unwrap(), public);

        let private_pem = private_key_to_pem(&private).unwrap();
        assert_eq!(private_key_from_pem(&private_pem).unwrap(), private);
    }

    #[test]
    fn public_key_from_pem_rejects_garbage() {
        assert!(matches!(
            public_key_from_pem("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----"),
            Err(CryptoError::Format(_))
        ));
    }

    #[test]
    fn key_id_is_stable() {
        let (_, public) = test_key_pair();
        let id = key_id(&public).unwrap();
        assert_eq!(id.len(), 16);
        assert_eq!(id, key_id(&public).unwrap());
    }

    #[test]
    fn save_and_load_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("server.pem");
        let (private, _) = test_key_pair();

        save_private_key(&private, &path).unwrap();
        let loaded = load_private_key(&path).unwrap();
        assert_eq!(loaded, private);
    }

    #[cfg(unix)]
    #[test]
    fn load_rejects_world_readable_key() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pem");
        let (private, _) = test_key_pair();
        save_private_key(&private, &path).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = load_private_key(&path).unwrap_err();
        assert!(err.to_string().contains("insecure permissions"));
    }
}

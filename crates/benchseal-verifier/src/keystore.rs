//! Private key store with rotation.
//!
//! Keys are indexed by the short fingerprint of their public half. Callers
//! receive [`KeyHandle`]s that hold an `Arc` to the key, so rotating or
//! retiring a key never disturbs a verification already holding it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use benchseal_crypto::hybrid::{key_id, load_private_key};
use benchseal_crypto::{RsaPrivateKey, RsaPublicKey};
use parking_lot::RwLock;
use tracing::info;

use crate::error::{Result, VerifierError};

/// A snapshot of one private key.
#[derive(Clone)]
pub struct KeyHandle {
    pub id: String,
    pub key: Arc<RsaPrivateKey>,
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHandle")
            .field("id", &self.id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Source of server private keys.
pub trait PrivateKeyStore: Send + Sync {
    /// The key new envelopes are expected to be sealed for.
    fn get_current(&self) -> Result<KeyHandle>;

    /// A specific key, current or retired.
    fn get_by_id(&self, id: &str) -> Result<KeyHandle>;
}

struct KeyRingInner {
    current: String,
    keys: HashMap<String, Arc<RsaPrivateKey>>,
}

/// In-memory versioned key map.
pub struct KeyRing {
    inner: RwLock<KeyRingInner>,
}

fn fingerprint(key: &RsaPrivateKey) -> Result<String> {
    Ok(key_id(&RsaPublicKey::from(key))?)
}

impl KeyRing {
    pub fn new(current: RsaPrivateKey) -> Result<Self> {
        let id = fingerprint(&current)?;
        let mut keys = HashMap::new();
        keys.insert(id.clone(), Arc::new(current));
        Ok(Self {
            inner: RwLock::new(KeyRingInner { current: id, keys }),
        })
    }

    /// Load the current key and any retired keys from PEM files.
    pub fn load(current: &Path, retired: &[PathBuf]) -> Result<Self> {
        let ring = Self::new(load_private_key(current)?)?;
        for path in retired {
            let id = ring.add_retired(load_private_key(path)?)?;
            info!(key_id = %id, path = %path.display(), "Loaded retired key");
        }
        info!(key_id = %ring.current_id(), "Key ring ready");
        Ok(ring)
    }

    /// Keep a superseded key available by id.
    pub fn add_retired(&self, key: RsaPrivateKey) -> Result<String> {
        let id = fingerprint(&key)?;
        self.inner
            .write()
            .keys
            .entry(id.clone())
            .or_insert_with(|| Arc::new(key));
        Ok(id)
    }

    /// Make `key` current. The previous key stays reachable by id.
    pub fn rotate(&self, key: RsaPrivateKey) -> Result<String> {
        let id = fingerprint(&key)?;
        let mut inner = self.inner.write();
        inner.keys.entry(id.clone()).or_insert_with(|| Arc::new(key));
        let previous = std::mem::replace(&mut inner.current, id.clone());
        drop(inner);
        info!(key_id = %id, previous = %previous, "Rotated current key");
        Ok(id)
    }

    /// Drop a retired key. The current key cannot be retired.
    pub fn retire(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.current == id {
            return false;
        }
        inner.keys.remove(id).is_some()
    }

    pub fn current_id(&self) -> String {
        self.inner.read().current.clone()
    }

    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().keys.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl PrivateKeyStore for KeyRing {
    fn get_current(&self) -> Result<KeyHandle> {
        let inner = self.inner.read();
        let key = inner
            .keys
            .get(&inner.current)
            .ok_or_else(|| VerifierError::KeyStore("current key missing from ring".into()))?;
        Ok(KeyHandle {
            id: inner.current.clone(),
            key: Arc::clone(key),
        })
    }

    fn get_by_id(&self, id: &str) -> Result<KeyHandle> {
        self.inner
            .read()
            .keys
            .get(id)
            .map(|key| KeyHandle {
                id: id.to_string(),
                key: Arc::clone(key),
            })
            .ok_or_else(|| VerifierError::KeyStore(format!("unknown key id {id}")))
    }
}

//! Nonce replay guard.
//!
//! Remembers `(scope, nonce)` pairs for a bounded time. The scope is a
//! fingerprint of the caller's API key, so one client cannot burn another
//! client's nonces and the key itself is never held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use benchseal_core::ClockSource;
use benchseal_crypto::CryptoError;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Scope identity for an API key: hex SHA-256 of its UTF-8 bytes.
pub fn scope_identity(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReplayKey {
    scope: String,
    nonce: String,
}

/// Thread-safe set of recently seen nonces.
#[derive(Debug)]
pub struct ReplayGuard {
    entries: Mutex<HashMap<ReplayKey, i64>>,
    ttl_secs: i64,
}

impl ReplayGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_secs: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// Atomically reserve `(scope, nonce)`.
    ///
    /// Fails with [`CryptoError::Replay`] if the pair is already held.
    /// Concurrent callers racing on the same pair see exactly one success.
    pub fn check_and_insert(&self, scope: &str, nonce: &str, now: i64) -> Result<(), CryptoError> {
        let key = ReplayKey {
            scope: scope.to_string(),
            nonce: nonce.to_string(),
        };
        let mut entries = self.entries.lock();
        if let Some(&inserted_at) = entries.get(&key) {
            if now.saturating_sub(inserted_at) < self.ttl_secs {
                return Err(CryptoError::Replay("nonce already used".into()));
            }
        }
        entries.insert(key, now);
        Ok(())
    }

    /// Give back a reservation made by [`check_and_insert`](Self::check_and_insert).
    pub fn release(&self, scope: &str, nonce: &str) -> bool {
        let key = ReplayKey {
            scope: scope.to_string(),
            nonce: nonce.to_string(),
        };
        self.entries.lock().remove(&key).is_some()
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn evict_expired(&self, now: i64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, inserted_at| now.saturating_sub(*inserted_at) < self.ttl_secs);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Run [`ReplayGuard::evict_expired`] every `every` on the tokio runtime.
pub fn spawn_eviction(
    guard: Arc<ReplayGuard>,
    clock: Arc<dyn ClockSource>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let removed = guard.evict_expired(clock.unix_now());
            if removed > 0 {
                info!(removed, remaining = guard.len(), "Evicted expired nonces");
            } else {
                debug!("Nonce eviction found nothing to remove");
            }
        }
    })
}

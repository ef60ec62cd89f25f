//! Server-side envelope verification.
//!
//! Eight ordered stages, each setting its own flag in a
//! [`ValidationReport`]. A format or key-unwrap failure halts the run; every
//! later stage runs whenever its inputs exist so operators see each failing
//! check, and content hashing is skipped only when decryption failed.

mod report;

use std::sync::Arc;

use benchseal_core::ClockSource;
use benchseal_crypto::envelope::EncryptedEnvelope;
use benchseal_crypto::kdf::{api_key_binding_hash, signing_key};
use benchseal_crypto::signature;
use benchseal_crypto::{
    CryptoError, SessionKey, canonical_hash, constant_time_eq, unwrap_session_key,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::keystore::{KeyHandle, PrivateKeyStore};
use crate::replay::{ReplayGuard, scope_identity};

pub use report::{ErrorCode, Stage, StageError, StageOutcome, StageResult, ValidationReport};

/// Data of an envelope that passed every stage.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedResult {
    pub scope: String,
    pub nonce: String,
    /// Base64 `log_hash` from the signature data.
    pub log_hash: String,
    pub signed_at: i64,
    pub payload: Value,
}

/// Outcome of one verification run.
#[derive(Debug, Clone)]
pub struct Verification {
    pub report: ValidationReport,
    pub key_id: String,
    /// Present only when `report.is_valid`.
    pub accepted: Option<AcceptedResult>,
}

impl Verification {
    pub const fn is_valid(&self) -> bool {
        self.report.is_valid
    }

    pub fn payload(&self) -> Option<&Value> {
        self.accepted.as_ref().map(|a| &a.payload)
    }
}

/// The verification state machine and its collaborators.
pub struct VerificationPipeline {
    keys: Arc<dyn PrivateKeyStore>,
    replay: Arc<ReplayGuard>,
    clock: Arc<dyn ClockSource>,
    window_secs: u64,
}

impl VerificationPipeline {
    pub fn new(
        keys: Arc<dyn PrivateKeyStore>,
        replay: Arc<ReplayGuard>,
        clock: Arc<dyn ClockSource>,
        window_secs: u64,
    ) -> Self {
        Self {
            keys,
            replay,
            clock,
            window_secs,
        }
    }

    pub fn keys(&self) -> &Arc<dyn PrivateKeyStore> {
        &self.keys
    }

    pub fn replay_guard(&self) -> &Arc<ReplayGuard> {
        &self.replay
    }

    /// Verify `document` against the current key.
    pub fn verify(&self, document: &[u8], api_key: &str) -> Result<Verification> {
        let key = self.keys.get_current()?;
        Ok(self.verify_with_key(document, api_key, &key))
    }

    /// Verify `document` against a key looked up by id.
    pub fn verify_with_key_id(
        &self,
        document: &[u8],
        api_key: &str,
        key_id: &str,
    ) -> Result<Verification> {
        let key = self.keys.get_by_id(key_id)?;
        Ok(self.verify_with_key(document, api_key, &key))
    }

    /// Run all stages with an already resolved key snapshot.
    ///
    /// Stage failures are recorded in the report and never returned as
    /// errors. A nonce reserved during the run is released again if the
    /// envelope is rejected for any reason.
    pub fn verify_with_key(&self, document: &[u8], api_key: &str, key: &KeyHandle) -> Verification {
        let mut run = Run {
            report: ValidationReport::default(),
            reserved: None,
        };
        let accepted = self.run_stages(&mut run, document, api_key, key);
        run.report.finish();

        if !run.report.is_valid {
            if let Some((scope, nonce)) = run.reserved.take() {
                self.replay.release(&scope, &nonce);
            }
            warn!(
                key_id = %key.id,
                failed = ?run.report.failed_stages(),
                "Envelope rejected"
            );
        } else {
            info!(key_id = %key.id, "Envelope accepted");
        }

        Verification {
            accepted: accepted.filter(|_| run.report.is_valid),
            key_id: key.id.clone(),
            report: run.report,
        }
    }

    fn run_stages(
        &self,
        run: &mut Run,
        document: &[u8],
        api_key: &str,
        key: &KeyHandle,
    ) -> Option<AcceptedResult> {
        let report = &mut run.report;

        // FORMAT_CHECK
        let envelope = match parse_document(document) {
            Ok(envelope) => {
                report.pass(Stage::FormatCheck);
                envelope
            }
            Err(e) => {
                report.fail(Stage::FormatCheck, e.to_string());
                report.skip_after(Stage::FormatCheck);
                return None;
            }
        };
        let data = &envelope.signature_data;

        // KEY_UNWRAP
        let session_key = match unwrap_session_key(&envelope.encrypted_session_key, &key.key) {
            Ok(session_key) => {
                report.pass(Stage::KeyUnwrap);
                session_key
            }
            Err(e) => {
                report.fail(Stage::KeyUnwrap, e.to_string());
                report.skip_after(Stage::KeyUnwrap);
                return None;
            }
        };

        // SIGNATURE_CHECK
        match check_signature(&session_key, &envelope) {
            Ok(()) => report.pass(Stage::SignatureCheck),
            Err(e) => report.fail(Stage::SignatureCheck, e.to_string()),
        }

        // TIMESTAMP_CHECK
        let now = self.clock.unix_now();
        let skew = now.abs_diff(data.timestamp);
        if skew <= self.window_secs {
            report.pass(Stage::TimestampCheck);
        } else {
            report.fail(
                Stage::TimestampCheck,
                format!("timestamp outside the {}s window", self.window_secs),
            );
        }

        // NONCE_CHECK
        let scope = scope_identity(api_key);
        match self.replay.check_and_insert(&scope, &data.nonce, now) {
            Ok(()) => {
                run.reserved = Some((scope.clone(), data.nonce.clone()));
                report.pass(Stage::NonceCheck);
            }
            Err(e) => report.fail(Stage::NonceCheck, e.to_string()),
        }

        // API_KEY_BINDING_CHECK
        match check_binding(api_key, &session_key, &envelope) {
            Ok(()) => report.pass(Stage::ApiKeyBindingCheck),
            Err(e) => report.fail(Stage::ApiKeyBindingCheck, e.to_string()),
        }

        // PAYLOAD_DECRYPT
        let plaintext = match envelope
            .encrypted_data
            .decode()
            .and_then(|encrypted| session_key.decrypt(&encrypted.ciphertext, &encrypted.nonce))
        {
            Ok(plaintext) => {
                report.pass(Stage::PayloadDecrypt);
                plaintext
            }
            Err(e) => {
                report.fail(Stage::PayloadDecrypt, e.to_string());
                report.skip(Stage::ContentHashCheck);
                return None;
            }
        };

        // CONTENT_HASH_CHECK
        match check_content_hash(&plaintext, &envelope) {
            Ok(payload) => {
                report.pass(Stage::ContentHashCheck);
                debug!(plaintext_len = plaintext.len(), "Content hash matched");
                Some(AcceptedResult {
                    scope,
                    nonce: data.nonce.clone(),
                    log_hash: data.log_hash.clone(),
                    signed_at: data.timestamp,
                    payload,
                })
            }
            Err(e) => {
                report.fail(Stage::ContentHashCheck, e.to_string());
                None
            }
        }
    }
}

struct Run {
    report: ValidationReport,
    reserved: Option<(String, String)>,
}

fn parse_document(document: &[u8]) -> std::result::Result<EncryptedEnvelope, CryptoError> {
    let value: Value = serde_json::from_slice(document)
        .map_err(|e| CryptoError::Format(format!("envelope is not valid JSON: {e}")))?;
    EncryptedEnvelope::parse(&value).map(|(_, envelope)| envelope)
}

fn check_signature(
    session_key: &SessionKey,
    envelope: &EncryptedEnvelope,
) -> std::result::Result<(), CryptoError> {
    let data = &envelope.signature_data;
    let key = signing_key(session_key, data.timestamp)?;
    signature::verify(key.as_slice(), data, &envelope.signature)
}

fn check_binding(
    api_key: &str,
    session_key: &SessionKey,
    envelope: &EncryptedEnvelope,
) -> std::result::Result<(), CryptoError> {
    let expected = api_key_binding_hash(api_key, session_key)?;
    let claimed = envelope.signature_data.api_key_hash_bytes()?;
    if constant_time_eq(&expected, &claimed) {
        Ok(())
    } else {
        Err(CryptoError::Binding)
    }
}

fn check_content_hash(
    plaintext: &[u8],
    envelope: &EncryptedEnvelope,
) -> std::result::Result<Value, CryptoError> {
    let payload: Value = serde_json::from_slice(plaintext)
        .map_err(|e| CryptoError::Format(format!("decrypted payload is not JSON: {e}")))?;
    let actual = canonical_hash(&payload)?;
    let claimed = envelope.signature_data.log_hash_bytes()?;
    if constant_time_eq(&actual, &claimed) {
        Ok(payload)
    } else {
        Err(CryptoError::Signature("content hash mismatch".into()))
    }
}

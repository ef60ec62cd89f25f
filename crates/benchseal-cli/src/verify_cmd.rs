//! `benchseal verify`: run the verification pipeline locally.
//!
//! For operators holding the server private key. Nothing is persisted and
//! the replay guard lives only for this run.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use benchseal_core::{ClockSource, FixedClock, SystemClock};
use benchseal_crypto::EncryptedEnvelope;
use benchseal_verifier::{
    KeyRing, ReplayGuard, Stage, StageOutcome, ValidationReport, VerificationPipeline,
};
use serde_json::Value;

/// Arguments for `benchseal verify`.
#[derive(clap::Args, Debug)]
pub struct VerifyArgs {
    /// Sealed envelope file.
    pub envelope: PathBuf,

    /// API key the envelope should be bound to.
    #[arg(long, env = "BENCHSEAL_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Server private key (PEM).
    #[arg(long, env = "BENCHSEAL_PRIVATE_KEY")]
    pub private_key: PathBuf,

    /// Retired private keys to try by key id. Repeatable.
    #[arg(long = "retired-key")]
    pub retired_keys: Vec<PathBuf>,

    /// Allowed clock skew in seconds.
    #[arg(long, default_value_t = 300)]
    pub window: u64,

    /// Evaluate the timestamp at signing time, for archived envelopes.
    #[arg(long)]
    pub ignore_age: bool,

    /// Print the decrypted payload when verification succeeds.
    #[arg(long)]
    pub show_payload: bool,

    /// Print the full report as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Execute `benchseal verify`.
pub async fn run(args: VerifyArgs) -> anyhow::Result<()> {
    let mut out = io::stdout();
    tokio::task::spawn_blocking(move || verify(&args, &mut out)).await?
}

fn verify(args: &VerifyArgs, out: &mut impl Write) -> anyhow::Result<()> {
    let document = std::fs::read(&args.envelope)
        .with_context(|| format!("Failed to read {}", args.envelope.display()))?;
    let keys = KeyRing::load(&args.private_key, &args.retired_keys)?;

    let clock: Arc<dyn ClockSource> = match signed_at(&document).filter(|_| args.ignore_age) {
        Some(timestamp) => Arc::new(FixedClock::new(timestamp)),
        None => Arc::new(SystemClock),
    };
    let pipeline = VerificationPipeline::new(
        Arc::new(keys),
        Arc::new(ReplayGuard::new(Duration::from_secs(
            args.window.saturating_mul(2).max(1),
        ))),
        clock,
        args.window,
    );

    let verification = pipeline.verify(&document, &args.api_key)?;
    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&verification.report)?)?;
    } else {
        writeln!(out, "Key id: {}", verification.key_id)?;
        print_report(&verification.report, out)?;
    }
    if args.show_payload {
        if let Some(payload) = verification.payload() {
            writeln!(out, "{}", serde_json::to_string_pretty(payload)?)?;
        }
    }

    anyhow::ensure!(verification.is_valid(), "envelope failed verification");
    Ok(())
}

/// Signed timestamp of a structurally valid envelope.
fn signed_at(document: &[u8]) -> Option<i64> {
    let value: Value = serde_json::from_slice(document).ok()?;
    let (_, envelope) = EncryptedEnvelope::parse(&value).ok()?;
    Some(envelope.signature_data.timestamp)
}

fn print_report(report: &ValidationReport, out: &mut impl Write) -> io::Result<()> {
    for stage in Stage::ALL {
        let outcome = match report.outcome(stage) {
            Some(StageOutcome::Passed) => "passed",
            Some(StageOutcome::Failed) => "FAILED",
            Some(StageOutcome::Skipped) => "skipped",
            None => "-",
        };
        writeln!(out, "  {:<24} {outcome}", stage.as_str())?;
    }
    for error in &report.errors {
        writeln!(out, "  {} {}", error.code, error.message)?;
    }
    writeln!(out, "Result: {}", if report.is_valid { "valid" } else { "INVALID" })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use benchseal_crypto::{save_envelope, save_private_key, seal_envelope, test_key_pair};
    use chrono::{DateTime, Utc};
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        args: VerifyArgs,
    }

    fn fixture(signed_at: DateTime<Utc>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (private, public) = test_key_pair();
        let key_path = dir.path().join("private.pem");
        save_private_key(&private, &key_path).unwrap();

        let envelope = seal_envelope(&json!({"score": 97}), "k1", &public, signed_at).unwrap();
        let envelope_path = dir.path().join("envelope.json");
        save_envelope(&envelope_path, &envelope).unwrap();

        let args = VerifyArgs {
            envelope: envelope_path,
            api_key: "k1".into(),
            private_key: key_path,
            retired_keys: Vec::new(),
            window: 300,
            ignore_age: false,
            show_payload: true,
            json: false,
        };
        Fixture { _dir: dir, args }
    }

    #[test]
    fn fresh_envelope_verifies_and_shows_payload() {
        let fx = fixture(Utc::now());
        let mut out = Vec::new();
        verify(&fx.args, &mut out).unwrap();

        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("Result: valid"), "{printed}");
        assert!(printed.contains("\"score\": 97"), "{printed}");
    }

    #[test]
    fn wrong_api_key_is_invalid() {
        let mut fx = fixture(Utc::now());
        fx.args.api_key = "k2".into();
        let mut out = Vec::new();
        let err = verify(&fx.args, &mut out).unwrap_err();

        assert!(err.to_string().contains("failed verification"));
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("API_KEY_BINDING_CHECK"), "{printed}");
        assert!(printed.contains("E1004"), "{printed}");
        assert!(!printed.contains("\"score\""), "{printed}");
    }

    #[test]
    fn archived_envelope_needs_ignore_age() {
        let old = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        let mut fx = fixture(old);
        assert!(verify(&fx.args, &mut Vec::new()).is_err());

        fx.args.ignore_age = true;
        verify(&fx.args, &mut Vec::new()).unwrap();
    }

    #[test]
    fn json_report_is_parseable() {
        let mut fx = fixture(Utc::now());
        fx.args.json = true;
        fx.args.show_payload = false;
        let mut out = Vec::new();
        verify(&fx.args, &mut out).unwrap();

        let report: ValidationReport = serde_json::from_slice(&out).unwrap();
        assert!(report.is_valid);
        assert!(report.nonce_valid);
    }
}

//! `benchseal seal`: encrypt a benchmark result into an online envelope.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use benchseal_core::ClientConfig;
use benchseal_core::config::default_offline_dir;
use benchseal_crypto::{
    EmbeddedKeyFragments, EncryptedEnvelope, PemPublicKey, PublicKeySource, save_envelope,
    seal_envelope,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::client::VerifierClient;

/// Arguments for `benchseal seal`.
#[derive(clap::Args, Debug)]
pub struct SealArgs {
    /// Benchmark result JSON file.
    pub payload: PathBuf,

    /// API key the envelope is bound to.
    #[arg(long, env = "BENCHSEAL_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Envelope file to write (default: a new file in the offline directory).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Server public key PEM (overrides the configured key).
    #[arg(long, conflicts_with = "fragments")]
    pub public_key: Option<PathBuf>,

    /// Obfuscated key fragment file (overrides the configured key).
    #[arg(long)]
    pub fragments: Option<PathBuf>,

    /// Sign with the verifier's clock instead of the local one.
    #[arg(long)]
    pub sync_time: bool,
}

/// Pick the public key: explicit flags first, then configured fragments,
/// then the configured PEM.
pub fn resolve_public_key(
    fragments: Option<&Path>,
    pem: Option<&Path>,
    config: &ClientConfig,
) -> anyhow::Result<Box<dyn PublicKeySource>> {
    if let Some(path) = fragments {
        return load_fragments(path);
    }
    if let Some(path) = pem {
        return load_pem(path);
    }
    if let Some(path) = &config.fragments_path {
        return load_fragments(path);
    }
    if let Some(path) = &config.public_key_path {
        return load_pem(path);
    }
    anyhow::bail!("No server public key configured (--public-key or --fragments)")
}

fn load_fragments(path: &Path) -> anyhow::Result<Box<dyn PublicKeySource>> {
    let key = EmbeddedKeyFragments::load(path)
        .with_context(|| format!("Failed to reassemble key from {}", path.display()))?;
    Ok(Box::new(key))
}

fn load_pem(path: &Path) -> anyhow::Result<Box<dyn PublicKeySource>> {
    let key = PemPublicKey::load(path)
        .with_context(|| format!("Failed to load public key {}", path.display()))?;
    Ok(Box::new(key))
}

/// Default location for an envelope that has not been uploaded yet.
pub fn pending_path(dir: &Path, envelope: &EncryptedEnvelope) -> PathBuf {
    let summary = envelope.summary();
    let nonce: String = summary.nonce.chars().take(8).collect();
    dir.join(format!("envelope-{}-{nonce}.json", summary.timestamp))
}

/// Directory holding envelopes awaiting upload.
pub fn offline_dir(config: &ClientConfig) -> anyhow::Result<PathBuf> {
    config
        .offline_dir
        .clone()
        .or_else(default_offline_dir)
        .context("Cannot determine offline directory (set client.offline_dir)")
}

/// Execute `benchseal seal`.
pub async fn run(args: SealArgs, config: &ClientConfig) -> anyhow::Result<()> {
    let now = if args.sync_time {
        let client = VerifierClient::from_config(config)?;
        let server_now = client.server_time().await?;
        let offset_ms = (server_now - Utc::now()).num_milliseconds();
        info!(offset_ms, "Using verifier clock");
        server_now
    } else {
        Utc::now()
    };
    seal(&args, config, now, &mut io::stdout())
}

fn seal(
    args: &SealArgs,
    config: &ClientConfig,
    now: DateTime<Utc>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&args.payload)
        .with_context(|| format!("Failed to read {}", args.payload.display()))?;
    let payload: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", args.payload.display()))?;
    if !payload.is_object() {
        warn!("Payload is not a JSON object");
    }

    let key = resolve_public_key(args.fragments.as_deref(), args.public_key.as_deref(), config)?;
    let envelope = seal_envelope(&payload, &args.api_key, key.public_key(), now)?;

    let path = match &args.output {
        Some(path) => path.clone(),
        None => pending_path(&offline_dir(config)?, &envelope),
    };
    save_envelope(&path, &envelope)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    let summary = envelope.summary();
    writeln!(out, "Sealed envelope written to {}", path.display())?;
    writeln!(out, "  timestamp: {}", summary.timestamp)?;
    writeln!(out, "  log hash:  {}...", summary.log_hash_prefix)?;
    writeln!(out, "  nonce:     {}", summary.nonce)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use benchseal_crypto::{load_envelope, public_key_to_pem, test_key_pair};

    const NOW: i64 = 1_750_000_000;

    fn fixture(dir: &Path) -> (SealArgs, ClientConfig) {
        let (_, public) = test_key_pair();
        let pem = dir.join("public.pem");
        std::fs::write(&pem, public_key_to_pem(&public).unwrap()).unwrap();
        let payload = dir.join("result.json");
        std::fs::write(&payload, r#"{"model":"m","tokens_per_second":41.5}"#).unwrap();

        let args = SealArgs {
            payload,
            api_key: "k1".into(),
            output: None,
            public_key: None,
            fragments: None,
            sync_time: false,
        };
        let config = ClientConfig {
            public_key_path: Some(pem),
            offline_dir: Some(dir.join("pending")),
            ..ClientConfig::default()
        };
        (args, config)
    }

    #[test]
    fn seal_stores_envelope_in_offline_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (args, config) = fixture(dir.path());
        let mut out = Vec::new();
        seal(&args, &config, DateTime::from_timestamp(NOW, 0).unwrap(), &mut out).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("pending"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);

        let envelope = load_envelope(&entries[0]).unwrap();
        assert_eq!(envelope.signature_data.timestamp, NOW);
        assert_eq!(entries[0], pending_path(&dir.path().join("pending"), &envelope));

        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains(&format!("timestamp: {NOW}")));
        assert!(printed.contains(&envelope.summary().log_hash_prefix));
        assert!(printed.contains(&envelope.signature_data.nonce));
    }

    #[test]
    fn explicit_output_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (mut args, config) = fixture(dir.path());
        args.output = Some(dir.path().join("out/envelope.json"));
        seal(&args, &config, Utc::now(), &mut Vec::new()).unwrap();

        assert!(dir.path().join("out/envelope.json").exists());
        assert!(!dir.path().join("pending").exists());
    }

    #[test]
    fn invalid_payload_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (args, config) = fixture(dir.path());
        std::fs::write(&args.payload, "{not json").unwrap();

        let err = seal(&args, &config, Utc::now(), &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"), "{err}");
    }

    #[test]
    fn missing_public_key_is_an_error() {
        let err = resolve_public_key(None, None, &ClientConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("No server public key"), "{err}");
    }
}

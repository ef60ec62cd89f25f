//! Upload subcommands: upload, status.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use benchseal_core::ClientConfig;
use benchseal_verifier::ProcessingStatus;
use serde_json::Value;
use tracing::{info, warn};

use crate::client::{UploadStatusResponse, VerifierClient};
use crate::seal_cmd::offline_dir;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Arguments for `benchseal upload`.
#[derive(clap::Args, Debug)]
pub struct UploadArgs {
    /// Envelope files to upload (default: everything in the offline directory).
    pub files: Vec<PathBuf>,

    /// API key the envelopes were sealed with.
    #[arg(long, env = "BENCHSEAL_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Metadata JSON sent alongside each envelope.
    #[arg(long, conflicts_with = "metadata_file")]
    pub metadata: Option<String>,

    /// File containing metadata JSON.
    #[arg(long)]
    pub metadata_file: Option<PathBuf>,

    /// Wait until the verifier has processed each upload.
    #[arg(long)]
    pub wait: bool,

    /// Keep pending envelopes after a successful upload. Without this,
    /// uploads from the offline directory are polled until processed.
    #[arg(long)]
    pub keep: bool,
}

/// Arguments for `benchseal status`.
#[derive(clap::Args, Debug)]
pub struct StatusArgs {
    pub upload_id: String,

    #[arg(long, env = "BENCHSEAL_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Poll until processing finishes.
    #[arg(long)]
    pub wait: bool,

    /// Print the raw status as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Execute `benchseal upload`.
pub async fn upload(args: UploadArgs, config: &ClientConfig) -> anyhow::Result<()> {
    let client = VerifierClient::from_config(config)?;
    upload_with(&client, args, config, &mut io::stdout()).await
}

/// Upload envelopes through `client`, reporting to `out`.
///
/// A pending envelope is removed only once the verifier reports it
/// `completed`, so removal always waits for processing to finish.
pub async fn upload_with(
    client: &VerifierClient,
    args: UploadArgs,
    config: &ClientConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let metadata = read_metadata(args.metadata.as_deref(), args.metadata_file.as_deref())?;
    let timeout = Duration::from_secs(config.request_timeout_secs.max(1));

    let from_pending = args.files.is_empty();
    let remove_on_success = from_pending && !args.keep;
    let files = if from_pending {
        pending_envelopes(&offline_dir(config)?)?
    } else {
        args.files
    };
    if files.is_empty() {
        writeln!(out, "No pending envelopes.")?;
        return Ok(());
    }

    let mut failures = 0usize;
    for path in &files {
        let envelope =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("envelope.json");

        let receipt = match client
            .upload(&args.api_key, envelope, file_name, metadata.as_deref())
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Upload failed");
                writeln!(out, "{}: upload failed: {e}", path.display())?;
                failures += 1;
                continue;
            }
        };
        info!(upload_id = %receipt.upload_id, "Envelope uploaded");
        writeln!(
            out,
            "{}: uploaded as {} ({})",
            path.display(),
            receipt.upload_id,
            receipt.processing_status
        )?;

        if !args.wait && !remove_on_success {
            continue;
        }
        let status = match client
            .wait_for_status(&receipt.upload_id, &args.api_key, POLL_INTERVAL, timeout)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(upload_id = %receipt.upload_id, error = %e, "Status unknown, envelope kept");
                writeln!(out, "{}: kept, status unknown: {e}", path.display())?;
                failures += 1;
                continue;
            }
        };
        print_status(&status, out)?;
        if status.processing_status != ProcessingStatus::Completed {
            failures += 1;
            continue;
        }

        if remove_on_success {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }

    anyhow::ensure!(failures == 0, "{failures} of {} uploads failed", files.len());
    Ok(())
}

/// Execute `benchseal status`.
pub async fn status(args: StatusArgs, config: &ClientConfig) -> anyhow::Result<()> {
    let client = VerifierClient::from_config(config)?;
    let status = if args.wait {
        let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        client
            .wait_for_status(&args.upload_id, &args.api_key, POLL_INTERVAL, timeout)
            .await?
    } else {
        client.status(&args.upload_id, &args.api_key).await?
    };

    let mut out = io::stdout();
    if args.json {
        let raw = serde_json::json!({
            "upload_id": status.upload_id,
            "processing_status": status.processing_status,
            "validation": status.validation,
            "result_id": status.result_id,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&raw)?)?;
    } else {
        print_status(&status, &mut out)?;
    }
    Ok(())
}

fn read_metadata(inline: Option<&str>, file: Option<&Path>) -> anyhow::Result<Option<String>> {
    let raw = match (inline, file) {
        (Some(raw), _) => raw.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => return Ok(None),
    };
    serde_json::from_str::<Value>(&raw).context("metadata is not valid JSON")?;
    Ok(Some(raw))
}

/// Envelope files waiting in `dir`, oldest name first.
pub fn pending_envelopes(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) fn print_status(status: &UploadStatusResponse, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "Upload {}: {}", status.upload_id, status.processing_status)?;
    if let Some(result_id) = &status.result_id {
        writeln!(out, "  result: {result_id}")?;
    }
    if let Some(report) = &status.validation {
        if report.is_valid {
            writeln!(out, "  all checks passed")?;
        }
        for error in &report.errors {
            writeln!(out, "  {} {}: {}", error.code, error.stage.as_str(), error.message)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn metadata_must_be_json() {
        assert!(read_metadata(Some("{oops"), None).is_err());
        assert_eq!(
            read_metadata(Some(r#"{"runner":"ci"}"#), None).unwrap().as_deref(),
            Some(r#"{"runner":"ci"}"#)
        );
        assert!(read_metadata(None, None).unwrap().is_none());
    }

    #[test]
    fn metadata_can_come_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, r#"{"gpu":"A100"}"#).unwrap();
        assert_eq!(
            read_metadata(None, Some(&path)).unwrap().as_deref(),
            Some(r#"{"gpu":"A100"}"#)
        );
    }

    #[test]
    fn pending_envelopes_lists_json_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("envelope-2-b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("envelope-1-a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let files = pending_envelopes(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["envelope-1-a.json", "envelope-2-b.json"]);
    }

    #[test]
    fn missing_offline_dir_has_no_pending_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pending_envelopes(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn failed_status_lists_errors() {
        let status: UploadStatusResponse = serde_json::from_value(serde_json::json!({
            "upload_id": "u1",
            "processing_status": "failed",
            "result_id": null,
            "validation": {
                "format_valid": true,
                "key_unwrap_valid": true,
                "signature_valid": true,
                "timestamp_valid": true,
                "nonce_valid": true,
                "api_key_valid": false,
                "decryption_valid": true,
                "content_hash_valid": true,
                "is_valid": false,
                "stages": [{"stage": "API_KEY_BINDING_CHECK", "outcome": "failed"}],
                "errors": [{
                    "stage": "API_KEY_BINDING_CHECK",
                    "code": "E1004",
                    "message": "API key binding mismatch"
                }]
            }
        }))
        .unwrap();

        let mut out = Vec::new();
        print_status(&status, &mut out).unwrap();
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("Upload u1: failed"));
        assert!(printed.contains("E1004 API_KEY_BINDING_CHECK"));
    }
}

//! Offline package subcommands: pack, unpack.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use benchseal_core::ClientConfig;
use benchseal_crypto::offline::{load_package, save_package};
use benchseal_crypto::{DatasetId, OfflinePackageCodec, load_private_key};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

/// Offline package actions.
#[derive(clap::Subcommand, Debug)]
pub enum OfflineAction {
    /// Encrypt a dataset into a self-contained package.
    Pack {
        /// Dataset JSON file.
        dataset: PathBuf,

        /// Dataset identifier (numeric ids stay numbers).
        #[arg(long)]
        dataset_id: String,

        /// Private key embedded in the package under the API key.
        #[arg(long, env = "BENCHSEAL_PRIVATE_KEY")]
        private_key: PathBuf,

        #[arg(long, env = "BENCHSEAL_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Package file to write.
        #[arg(short, long)]
        output: PathBuf,

        /// Days until the package expires (default from config).
        #[arg(long)]
        validity_days: Option<i64>,
    },
    /// Open a package and print or store its dataset.
    Unpack {
        /// Package file.
        package: PathBuf,

        /// API key the package was packed for.
        #[arg(long, env = "BENCHSEAL_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Open with a private key instead of the embedded one.
        #[arg(long)]
        private_key: Option<PathBuf>,

        /// Write the dataset here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Execute an offline subcommand.
pub fn run(action: OfflineAction, config: &ClientConfig) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        OfflineAction::Pack {
            dataset,
            dataset_id,
            private_key,
            api_key,
            output,
            validity_days,
        } => {
            let request = PackRequest {
                dataset,
                dataset_id: parse_dataset_id(&dataset_id),
                private_key,
                api_key,
                output,
                validity: TimeDelta::days(validity_days.unwrap_or(config.package_validity_days)),
            };
            pack(&request, Utc::now(), &mut out)
        }
        OfflineAction::Unpack {
            package,
            api_key,
            private_key,
            output,
        } => unpack(
            &package,
            api_key.as_deref(),
            private_key.as_deref(),
            output.as_deref(),
            Utc::now(),
            &mut out,
        ),
    }
}

struct PackRequest {
    dataset: PathBuf,
    dataset_id: DatasetId,
    private_key: PathBuf,
    api_key: String,
    output: PathBuf,
    validity: TimeDelta,
}

fn parse_dataset_id(raw: &str) -> DatasetId {
    raw.parse::<u64>()
        .map_or_else(|_| DatasetId::Text(raw.to_string()), DatasetId::Number)
}

fn pack(request: &PackRequest, now: DateTime<Utc>, out: &mut impl Write) -> anyhow::Result<()> {
    anyhow::ensure!(request.validity > TimeDelta::zero(), "validity must be positive");

    let content = std::fs::read_to_string(&request.dataset)
        .with_context(|| format!("Failed to read {}", request.dataset.display()))?;
    let dataset: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", request.dataset.display()))?;
    let private_key = load_private_key(&request.private_key)
        .with_context(|| format!("Failed to load {}", request.private_key.display()))?;

    let package = OfflinePackageCodec::new(request.validity).pack(
        &dataset,
        request.dataset_id.clone(),
        &request.api_key,
        &private_key,
        now,
    )?;
    save_package(&request.output, &package)
        .with_context(|| format!("Failed to write {}", request.output.display()))?;

    writeln!(out, "Package written to {}", request.output.display())?;
    writeln!(out, "  dataset: {}", package.metadata.dataset_id)?;
    writeln!(out, "  expires: {}", package.metadata.expires_at)?;
    Ok(())
}

fn unpack(
    package_path: &Path,
    api_key: Option<&str>,
    private_key: Option<&Path>,
    output: Option<&Path>,
    now: DateTime<Utc>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let package = load_package(package_path)
        .with_context(|| format!("Failed to read {}", package_path.display()))?;
    let codec = OfflinePackageCodec::default();

    let opened = match (private_key, api_key) {
        (Some(path), api_key) => {
            let key = load_private_key(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            codec.open_with_private_key(&package, &key, api_key, now)?
        }
        (None, Some(api_key)) => codec.unpack(&package, api_key, now)?,
        (None, None) => anyhow::bail!("An API key or a private key is required to open a package"),
    };

    let pretty = serde_json::to_string_pretty(&opened.dataset)?;
    match output {
        Some(path) => {
            std::fs::write(path, pretty)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            writeln!(
                out,
                "Dataset {} ({:?}) written to {}",
                opened.dataset_id,
                opened.profile,
                path.display()
            )?;
            if !opened.signature_checked {
                writeln!(out, "  user signature not checked")?;
            }
        }
        None => writeln!(out, "{pretty}")?,
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use benchseal_crypto::{CryptoError, save_private_key, test_key_pair};

    const NOW: i64 = 1_750_000_000;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(NOW, 0).unwrap()
    }

    fn packed(dir: &Path) -> PackRequest {
        let (private, _) = test_key_pair();
        let key_path = dir.join("private.pem");
        save_private_key(&private, &key_path).unwrap();
        let dataset = dir.join("dataset.json");
        std::fs::write(&dataset, r#"{"questions":[{"id":1,"prompt":"2+2"}]}"#).unwrap();

        let request = PackRequest {
            dataset,
            dataset_id: parse_dataset_id("42"),
            private_key: key_path,
            api_key: "k1".into(),
            output: dir.join("package.json"),
            validity: TimeDelta::days(30),
        };
        pack(&request, now(), &mut Vec::new()).unwrap();
        request
    }

    #[test]
    fn dataset_ids_keep_their_shape() {
        assert_eq!(parse_dataset_id("7"), DatasetId::Number(7));
        assert_eq!(parse_dataset_id("mmlu-v2"), DatasetId::Text("mmlu-v2".into()));
    }

    #[test]
    fn pack_then_unpack_with_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let request = packed(dir.path());
        let target = dir.path().join("dataset.out.json");

        let mut out = Vec::new();
        unpack(&request.output, Some("k1"), None, Some(target.as_path()), now(), &mut out).unwrap();

        let restored: Value =
            serde_json::from_str(&std::fs::read_to_string(&target).unwrap()).unwrap();
        assert_eq!(restored["questions"][0]["prompt"], "2+2");
        assert!(String::from_utf8(out).unwrap().contains("Dataset 42"));
    }

    #[test]
    fn unpack_with_private_key_skips_signature() {
        let dir = tempfile::tempdir().unwrap();
        let request = packed(dir.path());
        let target = dir.path().join("dataset.out.json");

        let mut out = Vec::new();
        unpack(
            &request.output,
            None,
            Some(request.private_key.as_path()),
            Some(target.as_path()),
            now(),
            &mut out,
        )
        .unwrap();
        assert!(String::from_utf8(out).unwrap().contains("not checked"));
    }

    #[test]
    fn wrong_api_key_cannot_unpack() {
        let dir = tempfile::tempdir().unwrap();
        let request = packed(dir.path());
        assert!(unpack(&request.output, Some("k2"), None, None, now(), &mut Vec::new()).is_err());
    }

    #[test]
    fn expired_package_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let request = packed(dir.path());
        let later = now() + TimeDelta::days(31);

        let err = unpack(&request.output, Some("k1"), None, None, later, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CryptoError>(),
            Some(CryptoError::PackageExpired(_))
        ));
    }

    #[test]
    fn unpack_needs_some_key() {
        let dir = tempfile::tempdir().unwrap();
        let request = packed(dir.path());
        let err = unpack(&request.output, None, None, None, now(), &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("required"));
    }
}

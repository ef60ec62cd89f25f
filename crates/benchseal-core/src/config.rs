//! Configuration resolution for BenchSeal.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/benchseal/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`BENCHSEAL_*`)
//! 5. CLI arguments (highest priority, applied by the binaries)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete BenchSeal configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Verification server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub listen_addr: String,
    pub database_path: Option<PathBuf>,
    /// Current private key (PKCS#8 or PKCS#1 PEM).
    pub private_key_path: Option<PathBuf>,
    /// Superseded keys still accepted for in-flight or stored envelopes.
    pub retired_key_paths: Vec<PathBuf>,
    /// Maximum allowed `|now - signed timestamp|`.
    pub timestamp_window_secs: i64,
    /// How long a seen nonce is remembered.
    pub replay_ttl_secs: u64,
    pub eviction_interval_secs: u64,
    pub max_upload_bytes: usize,
    pub log_level: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            database_path: None,
            private_key_path: None,
            retired_key_paths: Vec::new(),
            timestamp_window_secs: 300,
            replay_ttl_secs: 600,
            eviction_interval_secs: 60,
            max_upload_bytes: 10 * 1024 * 1024, // 10 MB
            log_level: "info".to_string(),
        }
    }
}

/// Client-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub public_key_path: Option<PathBuf>,
    /// Obfuscated public key fragments; preferred over `public_key_path`.
    pub fragments_path: Option<PathBuf>,
    /// Where sealed envelopes wait for upload.
    pub offline_dir: Option<PathBuf>,
    pub package_validity_days: i64,
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            public_key_path: None,
            fragments_path: None,
            offline_dir: None,
            package_validity_days: 30,
            request_timeout_secs: 30,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(path) = explicit {
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
    }

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());

    Ok(config)
}

/// Base directory for BenchSeal state.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".benchseal"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/benchseal"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("benchseal"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Path of the global settings file.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("settings.json"))
}

/// Default verifier database path.
pub fn default_database_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("verifier.db"))
}

/// Default directory for envelopes awaiting upload.
pub fn default_offline_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("pending"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    let v = overlay.verifier;
    if v.database_path.is_some() {
        base.verifier.database_path = v.database_path;
    }
    if v.private_key_path.is_some() {
        base.verifier.private_key_path = v.private_key_path;
    }
    if !v.retired_key_paths.is_empty() {
        base.verifier.retired_key_paths = v.retired_key_paths;
    }
    base.verifier.listen_addr = v.listen_addr;
    base.verifier.timestamp_window_secs = v.timestamp_window_secs;
    base.verifier.replay_ttl_secs = v.replay_ttl_secs;
    base.verifier.eviction_interval_secs = v.eviction_interval_secs;
    base.verifier.max_upload_bytes = v.max_upload_bytes;
    base.verifier.log_level = v.log_level;

    let c = overlay.client;
    if c.public_key_path.is_some() {
        base.client.public_key_path = c.public_key_path;
    }
    if c.fragments_path.is_some() {
        base.client.fragments_path = c.fragments_path;
    }
    if c.offline_dir.is_some() {
        base.client.offline_dir = c.offline_dir;
    }
    base.client.server_url = c.server_url;
    base.client.package_validity_days = c.package_validity_days;
    base.client.request_timeout_secs = c.request_timeout_secs;
}

fn parse_into<T: std::str::FromStr>(value: Option<String>, slot: &mut T) {
    if let Some(n) = value.and_then(|v| v.parse().ok()) {
        *slot = n;
    }
}

fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) {
    if let Some(val) = env("BENCHSEAL_LISTEN_ADDR") {
        config.verifier.listen_addr = val;
    }
    if let Some(val) = env("BENCHSEAL_DATABASE_PATH") {
        config.verifier.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = env("BENCHSEAL_PRIVATE_KEY") {
        config.verifier.private_key_path = Some(PathBuf::from(val));
    }
    parse_into(
        env("BENCHSEAL_TIMESTAMP_WINDOW_SECS"),
        &mut config.verifier.timestamp_window_secs,
    );
    parse_into(env("BENCHSEAL_REPLAY_TTL_SECS"), &mut config.verifier.replay_ttl_secs);
    parse_into(env("BENCHSEAL_MAX_UPLOAD_BYTES"), &mut config.verifier.max_upload_bytes);
    if let Some(val) = env("BENCHSEAL_LOG_LEVEL") {
        config.verifier.log_level = val;
    }
    if let Some(val) = env("BENCHSEAL_SERVER_URL") {
        config.client.server_url = val;
    }
    if let Some(val) = env("BENCHSEAL_PUBLIC_KEY") {
        config.client.public_key_path = Some(PathBuf::from(val));
    }
    if let Some(val) = env("BENCHSEAL_FRAGMENTS") {
        config.client.fragments_path = Some(PathBuf::from(val));
    }
    if let Some(val) = env("BENCHSEAL_OFFLINE_DIR") {
        config.client.offline_dir = Some(PathBuf::from(val));
    }
}

//! BenchSeal verification server
//!
//! HTTP upload service that verifies sealed benchmark envelopes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use benchseal_core::config::{default_database_path, load_config};
use benchseal_core::tracing_init::{LogTarget, init_tracing};
use benchseal_core::{ClockSource, SystemClock};
use benchseal_verifier::replay::spawn_eviction;
use benchseal_verifier::server::{AppState, build_router};
use benchseal_verifier::{KeyRing, ReplayGuard, ResultDatabase, UploadService, VerificationPipeline};

#[derive(Parser, Debug)]
#[command(name = "benchseal-verifier")]
#[command(version, about = "BenchSeal verification server - envelope upload and validation")]
struct Args {
    /// Path to a JSON settings file.
    #[arg(long, env = "BENCHSEAL_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    addr: Option<String>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Current server private key (PEM).
    #[arg(long)]
    private_key: Option<PathBuf>,

    /// Retired private keys still accepted by id (PEM). Repeatable.
    #[arg(long = "retired-key")]
    retired_keys: Vec<PathBuf>,

    /// Allowed clock skew in seconds.
    #[arg(long)]
    timestamp_window: Option<i64>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?.verifier;
    if let Some(addr) = args.addr {
        config.listen_addr = addr;
    }
    if let Some(path) = args.db_path {
        config.database_path = Some(path);
    }
    if let Some(path) = args.private_key {
        config.private_key_path = Some(path);
    }
    if !args.retired_keys.is_empty() {
        config.retired_key_paths = args.retired_keys;
    }
    if let Some(window) = args.timestamp_window {
        config.timestamp_window_secs = window;
    }

    init_tracing(
        &format!("benchseal_verifier={}", config.log_level),
        args.log_json,
        LogTarget::Stdout,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        "Starting benchseal-verifier"
    );

    let key_path = config
        .private_key_path
        .clone()
        .context("No private key configured (--private-key or BENCHSEAL_PRIVATE_KEY)")?;
    let keys = Arc::new(KeyRing::load(&key_path, &config.retired_key_paths)?);

    let db_path = match config.database_path.clone() {
        Some(path) => path,
        None => default_database_path().context("Cannot determine default database path")?,
    };
    info!(path = %db_path.display(), "Opening verifier database");
    let db = ResultDatabase::open(&db_path).await?;

    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
    let window = u64::try_from(config.timestamp_window_secs)
        .context("timestamp window must not be negative")?;
    // A nonce must outlive every instant its envelope's timestamp is accepted.
    let ttl = config.replay_ttl_secs.max(window.saturating_mul(2));
    let replay = Arc::new(ReplayGuard::new(Duration::from_secs(ttl)));
    let pipeline = Arc::new(VerificationPipeline::new(
        keys,
        Arc::clone(&replay),
        Arc::clone(&clock),
        window,
    ));

    let uploads = UploadService::new(db, pipeline);
    uploads.fail_interrupted().await?;

    // Background task dropping nonces older than the replay TTL
    let _eviction = spawn_eviction(
        replay,
        Arc::clone(&clock),
        Duration::from_secs(config.eviction_interval_secs.max(1)),
    );

    let app = build_router(AppState { uploads, clock }, config.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Verifier listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    info!("Verifier stopped");
    Ok(())
}

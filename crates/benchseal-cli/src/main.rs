//! `BenchSeal` CLI
//!
//! Seals benchmark results for the verification server and talks to it.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

use benchseal_cli::keys_cmd::{self, FragmentsArgs, KeygenArgs};
use benchseal_cli::offline_cmd::{self, OfflineAction};
use benchseal_cli::seal_cmd::{self, SealArgs};
use benchseal_cli::upload_cmd::{self, StatusArgs, UploadArgs};
use benchseal_cli::verify_cmd::{self, VerifyArgs};
use benchseal_core::config::load_config;
use benchseal_core::tracing_init::{LogTarget, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "benchseal")]
#[command(version, about = "BenchSeal - sealed benchmark results", long_about = None)]
struct Cli {
    /// Path to a JSON settings file.
    #[arg(long, env = "BENCHSEAL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Verifier base URL (overrides config).
    #[arg(long, global = true)]
    server: Option<String>,

    /// Output logs as JSON on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a server RSA key pair.
    Keygen(KeygenArgs),
    /// Split a public key into obfuscated fragments.
    Fragments(FragmentsArgs),
    /// Seal a benchmark result into an envelope.
    Seal(SealArgs),
    /// Upload sealed envelopes to the verifier.
    Upload(UploadArgs),
    /// Show the processing status of an upload.
    Status(StatusArgs),
    /// Verify an envelope locally with the server private key.
    Verify(VerifyArgs),
    /// Offline dataset packages.
    Offline {
        #[command(subcommand)]
        action: OfflineAction,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Stdout carries command output.
    init_tracing("benchseal_cli=warn,benchseal_crypto=warn", cli.log_json, LogTarget::Stderr);
    debug!(version = env!("CARGO_PKG_VERSION"), "Starting benchseal CLI");

    let mut config = load_config(cli.config.as_deref())?.client;
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    match cli.command {
        Command::Keygen(args) => keys_cmd::keygen(args).await,
        Command::Fragments(args) => keys_cmd::fragments(&args),
        Command::Seal(args) => seal_cmd::run(args, &config).await,
        Command::Upload(args) => upload_cmd::upload(args, &config).await,
        Command::Status(args) => upload_cmd::status(args, &config).await,
        Command::Verify(args) => verify_cmd::run(args).await,
        Command::Offline { action } => offline_cmd::run(action, &config),
    }
}

//! Key management subcommands: keygen, fragments.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use benchseal_crypto::hybrid::DEFAULT_KEY_BITS;
use benchseal_crypto::obfuscation::{DEFAULT_FRAGMENT_COUNT, save_fragments};
use benchseal_crypto::{
    FragmentCodec, RsaPublicKey, generate_private_key, key_id, public_key_from_pem,
    public_key_to_pem, save_private_key,
};
use tracing::info;

/// Arguments for `benchseal keygen`.
#[derive(clap::Args, Debug)]
pub struct KeygenArgs {
    /// Where to write the private key (PKCS#8 PEM, mode 600).
    #[arg(long, default_value = "server_private.pem")]
    pub private_out: PathBuf,

    /// Where to write the public key (SPKI PEM).
    #[arg(long, default_value = "server_public.pem")]
    pub public_out: PathBuf,

    /// RSA modulus size.
    #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
    pub bits: usize,

    /// Overwrite existing key files.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for `benchseal fragments`.
#[derive(clap::Args, Debug)]
pub struct FragmentsArgs {
    /// Public key PEM to split.
    #[arg(long)]
    pub public_key: PathBuf,

    /// Fragment file to write.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Number of fragments.
    #[arg(long, default_value_t = DEFAULT_FRAGMENT_COUNT)]
    pub count: usize,
}

/// Generate a server key pair.
pub async fn keygen(args: KeygenArgs) -> anyhow::Result<()> {
    let mut out = io::stdout();
    tokio::task::spawn_blocking(move || write_key_pair(&args, &mut out)).await?
}

fn write_key_pair(args: &KeygenArgs, out: &mut impl Write) -> anyhow::Result<()> {
    if !args.force {
        for path in [&args.private_out, &args.public_out] {
            anyhow::ensure!(
                !path.exists(),
                "{} already exists (use --force to overwrite)",
                path.display()
            );
        }
    }

    info!(bits = args.bits, "Generating RSA key pair");
    let private = generate_private_key(args.bits)?;
    let public = RsaPublicKey::from(&private);

    save_private_key(&private, &args.private_out)
        .with_context(|| format!("Failed to write {}", args.private_out.display()))?;
    if let Some(dir) = args.public_out.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&args.public_out, public_key_to_pem(&public)?)
        .with_context(|| format!("Failed to write {}", args.public_out.display()))?;

    writeln!(out, "Key id:      {}", key_id(&public)?)?;
    writeln!(out, "Private key: {}", args.private_out.display())?;
    writeln!(out, "Public key:  {}", args.public_out.display())?;
    Ok(())
}

/// Split a public key into obfuscated fragments for embedding in clients.
pub fn fragments(args: &FragmentsArgs) -> anyhow::Result<()> {
    write_fragments(args, &mut io::stdout())
}

fn write_fragments(args: &FragmentsArgs, out: &mut impl Write) -> anyhow::Result<()> {
    let pem = std::fs::read_to_string(&args.public_key)
        .with_context(|| format!("Failed to read {}", args.public_key.display()))?;
    let public = public_key_from_pem(&pem)?;

    let codec = FragmentCodec::with_default_seed()?;
    let fragments = codec.obfuscate(&pem, args.count)?;
    let reassembled = codec.reassemble(&fragments)?;
    anyhow::ensure!(
        reassembled == public,
        "fragments did not reassemble to the original key"
    );

    save_fragments(&args.output, &fragments)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    writeln!(
        out,
        "Wrote {} fragments for key {} to {}",
        fragments.len(),
        key_id(&public)?,
        args.output.display()
    )?;
    Ok(())
}

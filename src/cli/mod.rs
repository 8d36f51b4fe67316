//! # SSRCTL CLI
//!
//! Command-line interface for re-encrypting SealedSecrets after a
//! sealed-secrets controller key rotation.
//!
//! ## Usage
//!
//! ```bash
//! # Re-encrypt every SealedSecret in the cluster
//! ssrctl reencrypt --all
//!
//! # One namespace, keeping audit copies and a run report
//! ssrctl reencrypt --all --namespace payments --output-dir ./audit
//!
//! # Selected objects, validated and resealed but not submitted
//! ssrctl reencrypt --namespace payments db-credentials api-token --dry-run
//! ```
//!
//! Exit codes: `0` everything committed or skipped for an expected reason,
//! `1` at least one item failed or was cancelled, `2` the run could not start
//! or was aborted.

use clap::{Parser, Subcommand};
use sealed_secret_reencryptor::runtime::initialization::{
    init_tracing, install_crypto_provider, DEFAULT_LOG_FILTER,
};
use std::process::ExitCode;
use tracing::error;

mod reencrypt;

/// SealedSecret re-encryption CLI
#[derive(Parser)]
#[command(name = "ssrctl")]
#[command(
    about = "Re-encrypt SealedSecrets against the current sealed-secrets controller key",
    version,
    long_version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (git ",
        env!("BUILD_GIT_HASH"),
        ", built ",
        env!("BUILD_DATETIME"),
        ")"
    ),
    after_help = "\
Examples:
  ssrctl reencrypt --all
  ssrctl reencrypt --all --namespace payments --output-dir ./audit --concurrency 8
  ssrctl reencrypt --namespace payments db-credentials --dry-run
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes context to use
    #[arg(short, long, global = true)]
    context: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reseal SealedSecrets with the controller's current public key
    Reencrypt(reencrypt::ReencryptArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Must happen before any TLS client is built
    install_crypto_provider();

    let cli = Cli::parse();

    if let Err(e) = init_tracing(DEFAULT_LOG_FILTER) {
        eprintln!("❌ {e:#}");
        return ExitCode::from(2);
    }

    let result = match cli.command {
        Commands::Reencrypt(args) => reencrypt::reencrypt_command(cli.context.as_deref(), args).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::from(2)
        }
    }
}

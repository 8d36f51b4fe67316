//! # Reencrypt Command
//!
//! Runs one re-encryption pass and maps the report to an exit code.

use anyhow::Result;
use clap::{ArgGroup, Args};
use sealed_secret_reencryptor::config::ReencryptConfig;
use sealed_secret_reencryptor::runtime::initialization::{build_client, collaborators};
use sealed_secret_reencryptor::runtime::{run_reencryption, RunSettings};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("selection").required(true).args(["all", "names"])))]
pub struct ReencryptArgs {
    /// Re-encrypt every SealedSecret (in `--namespace`, or cluster-wide)
    #[arg(long, conflicts_with = "names")]
    all: bool,

    /// SealedSecret names to re-encrypt (requires --namespace)
    #[arg(value_name = "NAME", requires = "namespace")]
    names: Vec<String>,

    /// Namespace to process (defaults to all namespaces with --all)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Write audit copies and report.json under this directory
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Maximum number of SealedSecrets processed at once
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Validate and reseal without submitting updates
    #[arg(long)]
    dry_run: bool,

    /// Append progress lines to this file
    #[arg(long = "log", value_name = "PATH")]
    log: Option<PathBuf>,

    /// Namespace of the sealed-secrets controller
    #[arg(long, value_name = "NS")]
    controller_namespace: Option<String>,

    /// Service name of the sealed-secrets controller
    #[arg(long, value_name = "NAME")]
    controller_name: Option<String>,

    /// Certificate to seal with: a PEM file or an http(s) URL
    #[arg(long, value_name = "PATH|URL")]
    cert: Option<String>,

    /// kubeseal binary name or path
    #[arg(long = "kubeseal", value_name = "PATH")]
    kubeseal: Option<String>,

    /// Reseal objects already sealed with the current key
    #[arg(long)]
    force: bool,

    /// Pipeline passes per item after a concurrent modification
    #[arg(long, value_name = "N")]
    max_attempts: Option<u32>,

    /// Write the JSON run report to this path
    #[arg(long = "report", value_name = "PATH")]
    report: Option<PathBuf>,

    /// Write Prometheus metrics in textfile format to this path
    #[arg(long, value_name = "PATH")]
    metrics_file: Option<PathBuf>,

    /// Timeout for individual Kubernetes API calls, in seconds
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,
}

impl ReencryptArgs {
    /// Layer the flags over the environment-derived configuration
    fn into_settings(self, mut config: ReencryptConfig) -> RunSettings {
        if let Some(dir) = self.output_dir {
            config.output_dir = Some(dir);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(namespace) = self.controller_namespace {
            config.controller_namespace = namespace;
        }
        if let Some(name) = self.controller_name {
            config.controller_name = name;
        }
        if self.cert.is_some() {
            config.cert = self.cert;
        }
        if let Some(binary) = self.kubeseal {
            config.kubeseal_binary = binary;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(secs) = self.timeout_secs {
            config.call_timeout_secs = secs;
        }
        if self.metrics_file.is_some() {
            config.metrics_file = self.metrics_file;
        }
        config.dry_run |= self.dry_run;
        config.force |= self.force;
        config.log_path = self.log;
        config.report_path = self.report;

        RunSettings {
            config,
            namespace: self.namespace,
            names: if self.all { Vec::new() } else { self.names },
        }
    }
}

/// Run `ssrctl reencrypt` and return the process exit code
pub async fn reencrypt_command(context: Option<&str>, args: ReencryptArgs) -> Result<u8> {
    let settings = args.into_settings(ReencryptConfig::from_env());
    let client = build_client(context).await?;
    let collaborators = collaborators(&client, &settings.config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, letting in-flight items finish");
            on_interrupt.cancel();
        }
    });

    let report_path = settings.report_path();
    match run_reencryption(collaborators, settings, cancel).await {
        Ok(report) => {
            let icon = match report.exit_code() {
                0 => "✅",
                1 => "⚠️ ",
                _ => "❌",
            };
            println!("{icon} {}", report.summary());
            if let Some(reason) = &report.abort_reason {
                println!("   Aborted: {reason}");
            }
            if let Some(path) = report_path {
                println!("   Report: {}", path.display());
            }
            Ok(report.exit_code())
        }
        Err(e) => {
            eprintln!("❌ {e}");
            Ok(e.exit_code())
        }
    }
}

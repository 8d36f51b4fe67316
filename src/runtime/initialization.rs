//! # Initialization
//!
//! Process-level setup shared by every `ssrctl` command: the rustls crypto
//! provider, the tracing subscriber, metrics registration and the
//! Kubernetes client.

use crate::cluster::{Cluster, KubeCluster};
use crate::config::ReencryptConfig;
use crate::controller::reseal::{KubesealResealer, Resealer};
use crate::keys::{CertLocation, ControllerServiceSource, FileSource, KeySource, UrlSource};
use crate::observability;
use crate::runtime::Collaborators;
use anyhow::{anyhow, Context, Result};
use kube::config::KubeConfigOptions;
use kube::Client;
use std::sync::Arc;
use tracing::{debug, info};

/// Default `RUST_LOG` directive
pub const DEFAULT_LOG_FILTER: &str = "sealed_secret_reencryptor=info,ssrctl=info";

/// Install ring as the process-wide rustls crypto provider
///
/// Must run before any client is built. A provider installed earlier in the
/// process is kept.
pub fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
}

/// Install the global tracing subscriber, honouring `RUST_LOG`
pub fn init_tracing(default_filter: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize tracing: {e}"))?;

    info!(
        "ssrctl {} (git {}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_HASH"),
        env!("BUILD_DATETIME")
    );
    observability::metrics::register_metrics()?;
    Ok(())
}

/// Build a client from the kubeconfig, optionally pinned to `context`
///
/// Without a context the usual inference applies (in-cluster config, then
/// the kubeconfig's current context).
pub async fn build_client(context: Option<&str>) -> Result<Client> {
    let config = match context {
        Some(context) => {
            let options = KubeConfigOptions {
                context: Some(context.to_string()),
                ..KubeConfigOptions::default()
            };
            kube::Config::from_kubeconfig(&options)
                .await
                .with_context(|| format!("Failed to load kubeconfig context '{context}'"))?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };
    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Select the certificate source for `config.cert`
pub fn key_source(client: &Client, config: &ReencryptConfig) -> Arc<dyn KeySource> {
    match CertLocation::from_arg(config.cert.as_deref()) {
        CertLocation::Controller => Arc::new(ControllerServiceSource::new(
            client.clone(),
            config.controller_name.clone(),
        )),
        CertLocation::File(path) => Arc::new(FileSource::new(path)),
        CertLocation::Url(url) => Arc::new(UrlSource::new(url, config.call_timeout())),
    }
}

/// Production collaborators backed by the API server and `kubeseal`
pub fn collaborators(client: &Client, config: &ReencryptConfig) -> Collaborators {
    let cluster: Arc<dyn Cluster> =
        Arc::new(KubeCluster::new(client.clone()).with_page_size(config.list_page_size));
    let resealer: Arc<dyn Resealer> = Arc::new(KubesealResealer::new(
        config.kubeseal_binary.clone(),
        config.reseal_timeout(),
    ));
    Collaborators {
        cluster,
        resealer,
        key_source: key_source(client, config),
    }
}

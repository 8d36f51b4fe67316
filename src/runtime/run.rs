//! # Run
//!
//! One re-encryption run from discovery to the persisted report.
//!
//! ```text
//! discover refs ─► fetch key (once) ─► scheduler ─► report.json / metrics
//! ```
//!
//! Setup failures (unreachable cluster while listing, unusable certificate)
//! end the run before any item is processed and surface as [`RunError`].
//! Per-item failures never do; they are part of the [`RunReport`].

use crate::cluster::{Cluster, ClusterError, SealedSecretRef};
use crate::config::{ConfigError, ReencryptConfig};
use crate::constants::REPORT_FILE_NAME;
use crate::controller::audit::AuditWriter;
use crate::controller::engine::validation::{validate_namespace, validate_resource_name};
use crate::controller::engine::{Engine, EngineContext, EngineSettings, ReencryptionItem};
use crate::controller::reporter::{Reporter, RunReport};
use crate::controller::reseal::Resealer;
use crate::controller::scheduler::Scheduler;
use crate::controller::scratch::ScratchArena;
use crate::keys::{KeyFetchError, KeyProvider, KeySource, PublicKeyMaterial};
use crate::observability::metrics;
use futures::TryStreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// External systems a run talks to
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn Cluster>,
    pub resealer: Arc<dyn Resealer>,
    pub key_source: Arc<dyn KeySource>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// What to process and how
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub config: ReencryptConfig,
    /// Restrict the run to one namespace; `None` lists all namespaces
    pub namespace: Option<String>,
    /// Explicit SealedSecret names inside `namespace`; empty means all
    pub names: Vec<String>,
}

impl RunSettings {
    /// Human-readable run scope for the `START` line
    #[must_use]
    pub fn scope(&self) -> String {
        match (&self.namespace, self.names.is_empty()) {
            (None, _) => "all namespaces".to_string(),
            (Some(namespace), true) => format!("namespace {namespace}"),
            (Some(namespace), false) => format!("namespace {namespace} ({})", self.names.join(", ")),
        }
    }

    /// Where `report.json` goes, if anywhere
    #[must_use]
    pub fn report_path(&self) -> Option<PathBuf> {
        self.config.report_path.clone().or_else(|| {
            self.config
                .output_dir
                .as_ref()
                .map(|dir| dir.join(REPORT_FILE_NAME))
        })
    }

    fn check(&self) -> Result<(), RunError> {
        self.config.validate()?;
        if let Some(namespace) = &self.namespace {
            validate_namespace(namespace).map_err(RunError::InvalidArgument)?;
        } else if !self.names.is_empty() {
            return Err(RunError::InvalidArgument(
                "explicit names require a namespace".to_string(),
            ));
        }
        for name in &self.names {
            validate_resource_name(name, "name").map_err(RunError::InvalidArgument)?;
        }
        Ok(())
    }
}

/// Failures that end a run before any item is processed
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("cluster unreachable: {0}")]
    ClusterUnreachable(ClusterError),
    #[error("failed to list SealedSecrets: {0}")]
    ListFailed(ClusterError),
    #[error("failed to fetch the controller certificate: {0}")]
    KeyFetchFailed(#[from] KeyFetchError),
    #[error("failed to prepare {what}: {message}")]
    Setup { what: &'static str, message: String },
    #[error("interrupted while {0}")]
    Interrupted(&'static str),
}

impl RunError {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunError::Config(_) | RunError::InvalidArgument(_) => "InvalidArgument",
            RunError::ClusterUnreachable(_) => "ClusterUnreachable",
            RunError::ListFailed(_) => "ListFailed",
            RunError::KeyFetchFailed(_) => "KeyFetchFailed",
            RunError::Setup { .. } => "Setup",
            RunError::Interrupted(_) => "Interrupted",
        }
    }

    /// An interrupt exits like a cancelled run; every other setup failure is fatal
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Interrupted(_) => 1,
            _ => 2,
        }
    }
}

/// Execute one run
///
/// The metrics textfile, when configured, is written whether or not the run
/// got past setup.
pub async fn run_reencryption(
    collaborators: Collaborators,
    settings: RunSettings,
    cancel: CancellationToken,
) -> Result<RunReport, RunError> {
    let result = execute(collaborators, &settings, cancel).await;

    let outcome = match &result {
        Ok(report) => match report.exit_code() {
            0 => "success",
            1 => "failed",
            _ => "aborted",
        },
        Err(e) => {
            error!(error.kind = e.as_str(), "Run failed during setup: {e}");
            "aborted"
        }
    };
    metrics::increment_runs(outcome);
    if let Some(path) = &settings.config.metrics_file {
        if let Err(e) = metrics::write_textfile(path) {
            warn!("Failed to write metrics file {}: {e:#}", path.display());
        }
    }
    result
}

async fn execute(
    collaborators: Collaborators,
    settings: &RunSettings,
    cancel: CancellationToken,
) -> Result<RunReport, RunError> {
    settings.check()?;
    let config = &settings.config;

    let refs = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(RunError::Interrupted("discovering SealedSecrets")),
        refs = discover(collaborators.cluster.as_ref(), settings) => refs?,
    };
    info!(count = refs.len(), scope = %settings.scope(), "Discovered SealedSecrets");

    let provider = KeyProvider::new(Arc::clone(&collaborators.key_source));
    let key = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(RunError::Interrupted("fetching the certificate")),
        key = fetch_key(&provider, config) => key?,
    };

    let arena = ScratchArena::new().map_err(|e| RunError::Setup {
        what: "scratch directory",
        message: e.to_string(),
    })?;
    let mut reporter = Reporter::new(
        Some(key.fingerprint.clone()),
        config.dry_run,
        config.log_path.as_deref(),
    )
    .await
    .map_err(|e| RunError::Setup {
        what: "log file",
        message: e.to_string(),
    })?;
    info!(run_id = %reporter.run_id(), "Starting run");
    reporter.start(&settings.scope());
    reporter.flush_log().await;

    let context = EngineContext {
        cluster: collaborators.cluster,
        resealer: collaborators.resealer,
        key,
        arena: Arc::new(arena),
        audit: config.output_dir.clone().map(AuditWriter::new),
        settings: EngineSettings::from_config(config),
        cancel,
    };
    let scheduler = Scheduler::new(Engine::new(Arc::new(context)), config.max_attempts)
        .with_key_max_age(config.key_max_age());
    let items = refs.into_iter().map(ReencryptionItem::new).collect();
    let report = scheduler.run(items, config.concurrency, reporter).await;

    if let Some(path) = settings.report_path() {
        match AuditWriter::write_json(&path, "run report", &report).await {
            Ok(()) => info!(path = %path.display(), "Wrote run report"),
            Err(e) => error!("Failed to write run report: {e}"),
        }
    }
    Ok(report)
}

/// Resolve the items of the run in discovery order
///
/// Explicit names are taken as given; the engine reports the ones that do
/// not exist. Otherwise the cluster is listed, each page bounded by the call
/// timeout.
/// Current certificate, bounded by the per-call timeout
async fn fetch_key(
    provider: &KeyProvider,
    config: &ReencryptConfig,
) -> Result<Arc<PublicKeyMaterial>, KeyFetchError> {
    let timeout = config.call_timeout();
    let namespace = config.controller_namespace.as_str();
    tokio::time::timeout(timeout, provider.current_public_key(namespace))
        .await
        .unwrap_or_else(|_elapsed| {
            Err(KeyFetchError::Unreachable {
                source_desc: provider.describe(namespace),
                message: format!("no response within {}s", timeout.as_secs()),
            })
        })
}

async fn discover(
    cluster: &dyn Cluster,
    settings: &RunSettings,
) -> Result<Vec<SealedSecretRef>, RunError> {
    if let (Some(namespace), false) = (&settings.namespace, settings.names.is_empty()) {
        return Ok(settings
            .names
            .iter()
            .map(|name| SealedSecretRef::new(namespace.as_str(), name.as_str(), None))
            .collect());
    }

    let timeout = settings.config.call_timeout();
    let mut listing = cluster.list_sealed_secrets(settings.namespace.as_deref());
    let mut refs = Vec::new();
    loop {
        let next = tokio::time::timeout(timeout, listing.try_next())
            .await
            .unwrap_or_else(|_elapsed| Err(ClusterError::Timeout(timeout)));
        match next {
            Ok(Some(reference)) => refs.push(reference),
            Ok(None) => return Ok(refs),
            Err(e) if e.is_retryable() => return Err(RunError::ClusterUnreachable(e)),
            Err(e) => return Err(RunError::ListFailed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(namespace: Option<&str>, names: &[&str]) -> RunSettings {
        RunSettings {
            config: ReencryptConfig::default(),
            namespace: namespace.map(str::to_string),
            names: names.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_scope_rendering() {
        assert_eq!(settings(None, &[]).scope(), "all namespaces");
        assert_eq!(settings(Some("payments"), &[]).scope(), "namespace payments");
        assert_eq!(
            settings(Some("payments"), &["db", "api"]).scope(),
            "namespace payments (db, api)"
        );
    }

    #[test]
    fn test_report_path_prefers_explicit_path() {
        let mut s = settings(None, &[]);
        assert_eq!(s.report_path(), None);

        s.config.output_dir = Some(PathBuf::from("/tmp/audit"));
        assert_eq!(s.report_path(), Some(PathBuf::from("/tmp/audit/report.json")));

        s.config.report_path = Some(PathBuf::from("/tmp/run.json"));
        assert_eq!(s.report_path(), Some(PathBuf::from("/tmp/run.json")));
    }

    #[test]
    fn test_names_require_namespace() {
        let err = settings(None, &["db"]).check().unwrap_err();
        assert!(matches!(err, RunError::InvalidArgument(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let err = settings(Some("payments"), &["Not_Valid"]).check().unwrap_err();
        assert!(matches!(err, RunError::InvalidArgument(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut s = settings(None, &[]);
        s.config.concurrency = 0;
        assert!(matches!(s.check(), Err(RunError::Config(ConfigError::Concurrency(0)))));
    }
}

//! # Reencryption Engine
//!
//! Drives one SealedSecret through
//! validate → wait-for-decryption → reseal → verify → commit.
//!
//! One engine pass owns one [`ReencryptionItem`]; engines share only
//! read-only context (cluster handle, resealer, public key, scratch arena).
//! Every pass ends in a terminal state and yields an [`ItemOutcome`].
//!
//! The commit is the only mutating call. It carries the resourceVersion
//! captured at `Discovered` and is attempted at most once per pass.

pub mod outcome;
pub mod state;
pub mod validation;

pub use outcome::ItemOutcome;
pub use state::{ErrorKind, InvalidTransition, ItemState, ReencryptionItem, SkipReason};

use crate::cluster::{fetch_sealed_secret_spec, Cluster, ClusterError};
use crate::config::ReencryptConfig;
use crate::controller::audit::AuditWriter;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::fingerprint::CiphertextFingerprint;
use crate::controller::reseal::{PlaintextSecret, ResealError, ResealRequest, Resealer};
use crate::controller::scratch::ScratchArena;
use crate::keys::PublicKeyMaterial;
use crate::observability::metrics;
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Per-run engine settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub dry_run: bool,
    pub force: bool,
    pub call_timeout: Duration,
    pub read_attempts: u32,
    pub backoff_start: Duration,
    pub backoff_max: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&ReencryptConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &ReencryptConfig) -> Self {
        Self {
            dry_run: config.dry_run,
            force: config.force,
            call_timeout: config.call_timeout(),
            read_attempts: config.read_attempts.max(1),
            backoff_start: config.backoff_start_duration(),
            backoff_max: config.backoff_max_duration(),
        }
    }
}

/// Read-only context shared by every engine pass of a run
pub struct EngineContext {
    pub cluster: Arc<dyn Cluster>,
    pub resealer: Arc<dyn Resealer>,
    pub key: Arc<PublicKeyMaterial>,
    pub arena: Arc<ScratchArena>,
    pub audit: Option<AuditWriter>,
    pub settings: EngineSettings,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("key", &self.key.fingerprint)
            .field("audit", &self.audit)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Why a pass stopped before `Committed`
#[derive(Debug)]
enum Stop {
    Fail(ErrorKind, String),
    Skip(SkipReason, String),
}

impl Stop {
    fn cancelled() -> Self {
        Stop::Fail(ErrorKind::Cancelled, "run cancelled".to_string())
    }

    /// Map a cluster error; `rejected` is the kind used for authorization or admission refusals
    fn from_cluster(err: ClusterError, rejected: ErrorKind) -> Self {
        match err {
            ClusterError::Unreachable(_) | ClusterError::Timeout(_) => {
                Stop::Fail(ErrorKind::ClusterUnreachable, err.to_string())
            }
            ClusterError::Conflict { .. } => {
                Stop::Fail(ErrorKind::ConcurrentModification, err.to_string())
            }
            ClusterError::NotFound { .. } => Stop::Skip(SkipReason::Deleted, err.to_string()),
            ClusterError::Rejected { .. } => Stop::Fail(rejected, err.to_string()),
        }
    }

    fn from_call(err: CallError, rejected: ErrorKind) -> Self {
        match err {
            CallError::Cancelled => Stop::cancelled(),
            CallError::Cluster(e) => Stop::from_cluster(e, rejected),
        }
    }
}

impl From<InvalidTransition> for Stop {
    fn from(err: InvalidTransition) -> Self {
        Stop::Fail(ErrorKind::Internal, err.to_string())
    }
}

/// Outcome of a cancellable cluster call
#[derive(Debug)]
enum CallError {
    Cluster(ClusterError),
    Cancelled,
}

/// Data collected along the pipeline for the outcome
#[derive(Debug, Default)]
struct Trace {
    old_fingerprint: Option<CiphertextFingerprint>,
    new_fingerprint: Option<CiphertextFingerprint>,
    audit_path: Option<PathBuf>,
    write_attempted: bool,
    detail: Option<String>,
}

/// Per-item state machine runner
#[derive(Debug, Clone)]
pub struct Engine {
    ctx: Arc<EngineContext>,
}

impl Engine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Run one pass for `item` to a terminal state
    pub async fn process(&self, mut item: ReencryptionItem) -> ItemOutcome {
        let started = Instant::now();
        let span = info_span!(
            "reencrypt.item",
            resource.namespace = %item.reference.namespace,
            resource.name = %item.reference.name,
            attempt = item.attempts,
        );
        let mut trace = Trace::default();

        let result = self
            .run(&mut item, &mut trace)
            .instrument(span.clone())
            .await;

        span.in_scope(|| match result {
            Ok(()) => {
                info!(
                    old = %trace.old_fingerprint.as_ref().map(CiphertextFingerprint::short).unwrap_or("-"),
                    new = %trace.new_fingerprint.as_ref().map(CiphertextFingerprint::short).unwrap_or("-"),
                    "SealedSecret re-encrypted"
                );
            }
            Err(Stop::Fail(kind, message)) => {
                if kind == ErrorKind::Cancelled {
                    warn!("Item cancelled: {message}");
                } else {
                    error!(error.kind = kind.as_str(), "Item failed: {message}");
                    error!("Remediation: {}", kind.remediation());
                }
                if let Err(e) = item.fail(kind, message) {
                    error!("Failed to record failure: {e}");
                }
            }
            Err(Stop::Skip(reason, detail)) => {
                info!(skip.reason = reason.as_str(), "Item skipped: {detail}");
                trace.detail = Some(detail);
                if let Err(e) = item.transition(ItemState::Skipped(reason)) {
                    error!("Failed to record skip: {e}");
                }
            }
        });

        let elapsed = started.elapsed();
        metrics::observe_item_duration(elapsed.as_secs_f64());

        let mut outcome = ItemOutcome::from_item(&item);
        outcome.old_fingerprint = trace.old_fingerprint;
        outcome.new_fingerprint = trace.new_fingerprint;
        outcome.audit_path = trace.audit_path;
        outcome.write_attempted = trace.write_attempted;
        outcome.detail = trace.detail;
        outcome.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        outcome
    }

    async fn run(&self, item: &mut ReencryptionItem, trace: &mut Trace) -> Result<(), Stop> {
        let ctx = &*self.ctx;

        // Discovered: capture resourceVersion and ciphertext fingerprint
        self.ensure_not_cancelled()?;
        let listed = item.reference.clone();
        let object = self
            .read(|| ctx.cluster.fetch_sealed_secret(&listed))
            .await
            .map_err(|e| Stop::from_call(e, ErrorKind::ValidationError))?;
        if let Some(reference) = object.reference() {
            item.reference = reference;
        }
        let summary = fetch_sealed_secret_spec(&object);
        let captured_version = object.metadata.resource_version.clone();
        trace.old_fingerprint = Some(summary.encrypted_data_fingerprint.clone());
        debug!(
            resource_version = ?captured_version,
            fingerprint = %summary.encrypted_data_fingerprint.short(),
            "Captured SealedSecret"
        );

        validation::validate_sealed_secret(&object)
            .map_err(|message| Stop::Fail(ErrorKind::ValidationError, message))?;
        self.ensure_not_cancelled()?;
        self.call(ctx.cluster.dry_run_update(&object))
            .await
            .map_err(|e| Stop::from_call(e, ErrorKind::ValidationError))?;
        self.advance(item, ItemState::Validated)?;

        // Validated: resolve the decrypted Secret's name
        item.expected_secret_name = Some(summary.template_target_name.clone());
        if !ctx.settings.force
            && object.key_fingerprint_annotation() == Some(ctx.key.fingerprint.as_str())
        {
            return Err(Stop::Skip(
                SkipReason::KeyUnchanged,
                format!("already sealed with key {}", ctx.key.short_fingerprint()),
            ));
        }
        self.advance(item, ItemState::AwaitingDecryption)?;

        // AwaitingDecryption: the controller must have materialized the Secret
        self.ensure_not_cancelled()?;
        let namespace = item.reference.namespace.clone();
        let target = summary.template_target_name.clone();
        let secret = match self.read(|| ctx.cluster.fetch_secret(&namespace, &target)).await {
            Ok(Some(secret)) => secret,
            Ok(None) | Err(CallError::Cluster(ClusterError::NotFound { .. })) => {
                let mut detail = format!("Secret '{namespace}/{target}' not found");
                if let Some(message) = object.synced_condition_message() {
                    detail.push_str(&format!("; controller reports: {message}"));
                }
                return Err(Stop::Skip(SkipReason::NoDecryptedSecret, detail));
            }
            Err(e) => return Err(Stop::from_call(e, ErrorKind::ResealFailed)),
        };
        // Strict and namespace-wide sealing bind to the SealedSecret's own identity
        let plaintext = PlaintextSecret::from_secret(&secret, &namespace, &item.reference.name);
        drop(secret);
        if plaintext.is_empty() {
            return Err(Stop::Fail(
                ErrorKind::ResealFailed,
                format!("decrypted Secret '{namespace}/{target}' has no data"),
            ));
        }

        let slot = ctx
            .arena
            .slot(&item.reference, item.attempts)
            .map_err(|e| Stop::Fail(ErrorKind::ResealFailed, format!("scratch slot: {e}")))?;
        self.ensure_not_cancelled()?;
        let reseal_started = Instant::now();
        let request = ResealRequest {
            secret: &plaintext,
            key: &ctx.key,
            scope: object.sealing_scope(),
            scratch: &slot,
        };
        let resealed = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return Err(Stop::cancelled()),
            result = ctx.resealer.reseal(request) => result,
        };
        metrics::observe_reseal_duration(reseal_started.elapsed().as_secs_f64());
        drop(plaintext);
        drop(slot);
        let new_data = resealed.map_err(|e| match e {
            ResealError::Representation(_) => {
                Stop::Fail(ErrorKind::RepresentationInvalid, e.to_string())
            }
            other => Stop::Fail(ErrorKind::ResealFailed, other.to_string()),
        })?;
        self.advance(item, ItemState::Resealed)?;

        // Resealed: the ciphertext must actually change
        let new_fingerprint = CiphertextFingerprint::of(&new_data);
        trace.new_fingerprint = Some(new_fingerprint.clone());
        if new_fingerprint == summary.encrypted_data_fingerprint {
            return Err(Stop::Fail(
                ErrorKind::NoChangeDetected,
                format!(
                    "resealed ciphertext is identical to the current ciphertext ({})",
                    new_fingerprint.short()
                ),
            ));
        }
        self.advance(item, ItemState::Verified)?;

        // Verified: audit copy, then the single guarded write
        let updated = object.with_resealed_data(new_data, &ctx.key.fingerprint, Utc::now());
        if let Some(audit) = &ctx.audit {
            let path = audit
                .write_resealed(&item.reference, &updated)
                .await
                .map_err(|e| Stop::Fail(ErrorKind::WriteConflict, e.to_string()))?;
            trace.audit_path = Some(path);
        }
        if ctx.settings.dry_run {
            return Err(Stop::Skip(
                SkipReason::DryRun,
                "dry-run: update not submitted".to_string(),
            ));
        }

        self.ensure_not_cancelled()?;
        let current_ref = item.reference.clone();
        let current = self
            .read(|| ctx.cluster.fetch_sealed_secret(&current_ref))
            .await
            .map_err(|e| Stop::from_call(e, ErrorKind::WriteConflict))?;
        if current.metadata.resource_version != captured_version {
            return Err(Stop::Fail(
                ErrorKind::ConcurrentModification,
                format!(
                    "resourceVersion changed from {} to {} since it was read",
                    captured_version.as_deref().unwrap_or("<none>"),
                    current.metadata.resource_version.as_deref().unwrap_or("<none>")
                ),
            ));
        }

        // No cancellation past this point: the update is either submitted or not
        trace.write_attempted = true;
        let commit_started = Instant::now();
        let committed = tokio::time::timeout(
            ctx.settings.call_timeout,
            ctx.cluster.update_sealed_secret(&updated),
        )
        .await
        .unwrap_or_else(|_elapsed| Err(ClusterError::Timeout(ctx.settings.call_timeout)));
        metrics::observe_commit_duration(commit_started.elapsed().as_secs_f64());
        let committed = committed.map_err(|e| match e {
            ClusterError::Conflict { .. } | ClusterError::NotFound { .. } => {
                Stop::Fail(ErrorKind::ConcurrentModification, e.to_string())
            }
            ClusterError::Rejected { .. } => Stop::Fail(ErrorKind::WriteConflict, e.to_string()),
            ClusterError::Unreachable(_) | ClusterError::Timeout(_) => {
                Stop::Fail(ErrorKind::ClusterUnreachable, e.to_string())
            }
        })?;
        debug!(
            resource_version = ?committed.metadata.resource_version,
            "Update accepted"
        );
        self.advance(item, ItemState::Committed)?;
        Ok(())
    }

    fn advance(&self, item: &mut ReencryptionItem, next: ItemState) -> Result<(), Stop> {
        item.transition(next)?;
        debug!(state = %next, "Item advanced");
        Ok(())
    }

    fn ensure_not_cancelled(&self) -> Result<(), Stop> {
        if self.ctx.cancel.is_cancelled() {
            Err(Stop::cancelled())
        } else {
            Ok(())
        }
    }

    /// Single cluster call bounded by the call timeout and the run's cancellation
    async fn call<T, Fut>(&self, future: Fut) -> Result<T, CallError>
    where
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let timeout = self.ctx.settings.call_timeout;
        tokio::select! {
            biased;
            () = self.ctx.cancel.cancelled() => Err(CallError::Cancelled),
            result = tokio::time::timeout(timeout, future) => result
                .unwrap_or_else(|_elapsed| Err(ClusterError::Timeout(timeout)))
                .map_err(CallError::Cluster),
        }
    }

    /// Cluster read retried with Fibonacci backoff while the failure is transient
    async fn read<T, F, Fut>(&self, mut call: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let settings = &self.ctx.settings;
        let mut backoff = FibonacciBackoff::new(settings.backoff_start, settings.backoff_max);
        let mut attempt = 1;
        loop {
            match self.call(call()).await {
                Err(CallError::Cluster(e)) if e.is_retryable() && attempt < settings.read_attempts => {
                    let delay = backoff.next_backoff();
                    warn!(
                        attempt,
                        max_attempts = settings.read_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Transient cluster read failure, retrying: {e}"
                    );
                    metrics::increment_read_retries();
                    tokio::select! {
                        biased;
                        () = self.ctx.cancel.cancelled() => return Err(CallError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

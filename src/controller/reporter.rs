//! # Reporter
//!
//! Single aggregation point for item outcomes. Engines report over a channel
//! in completion order; the reporter restores discovery order, renders the
//! log taxonomy and builds the [`RunReport`].
//!
//! ```text
//! [2026-10-18T09:30:00Z] START: Re-encrypting SealedSecrets in all namespaces (key 3f2a9c01b7de)
//! [2026-10-18T09:30:01Z] Processing: payments/db
//! [2026-10-18T09:30:01Z] SUCCESS: Re-encrypted payments/db
//! [2026-10-18T09:30:01Z] VERIFIED: Ciphertext updated payments/db
//! [2026-10-18T09:30:02Z] Processing: payments/api
//! [2026-10-18T09:30:02Z] WARNING: Decrypted secret not found payments/api (expected Secret 'api')
//! [2026-10-18T09:30:02Z] END: Re-encryption finished
//! [2026-10-18T09:30:02Z] SUMMARY: 2 items: Committed=1, Skipped(NoDecryptedSecret)=1
//! ```
//!
//! The log file given with `--log` is written only by the reporter.

use crate::controller::engine::{ItemOutcome, ItemState, SkipReason};
use crate::observability::metrics;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 128;

/// Messages sent to the reporter task
#[derive(Debug)]
pub enum ReportEvent {
    /// Terminal outcome of the item listed at `index`
    Outcome { index: usize, outcome: ItemOutcome },
    /// The run was aborted; remaining items will be reported as not started
    Abort { reason: String },
}

/// Aggregated result of one run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub key_fingerprint: Option<String>,
    pub dry_run: bool,
    /// Item count per terminal state label
    pub counts: BTreeMap<String, usize>,
    /// Outcomes in discovery order
    pub outcomes: Vec<ItemOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub peak_active_engines: usize,
    /// Rendered taxonomy lines
    #[serde(skip)]
    pub lines: Vec<String>,
}

impl RunReport {
    fn new(run_id: Uuid, key_fingerprint: Option<String>, dry_run: bool) -> Self {
        Self {
            run_id,
            started: Utc::now(),
            ended: None,
            key_fingerprint,
            dry_run,
            counts: BTreeMap::new(),
            outcomes: Vec::new(),
            abort_reason: None,
            peak_active_engines: 0,
            lines: Vec::new(),
        }
    }

    /// A report for a run that failed before any item was processed
    pub fn aborted(dry_run: bool, reason: impl Into<String>) -> Self {
        let mut report = Self::new(Uuid::new_v4(), None, dry_run);
        report.abort_reason = Some(reason.into());
        report.ended = Some(Utc::now());
        report
    }

    /// Number of items that ended in the state labelled `label`
    #[must_use]
    pub fn count(&self, label: &str) -> usize {
        self.counts.get(label).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn committed(&self) -> usize {
        self.count("Committed")
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.error_kind().is_some())
            .count()
    }

    /// Outcome of `namespace/name`, if it was part of the run
    #[must_use]
    pub fn outcome(&self, namespace: &str, name: &str) -> Option<&ItemOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.reference.namespace == namespace && o.reference.name == name)
    }

    /// Process exit code
    ///
    /// - `0`: every item Committed or skipped for an expected reason
    /// - `1`: any failed item, or items cancelled before they ran
    /// - `2`: the run was aborted
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if self.abort_reason.is_some() {
            return 2;
        }
        let unclean = self.outcomes.iter().any(|o| match o.final_state {
            ItemState::Failed(_) => true,
            ItemState::Skipped(reason) => !reason.is_expected(),
            _ => false,
        });
        u8::from(unclean)
    }

    /// One-line summary of the counts
    #[must_use]
    pub fn summary(&self) -> String {
        if self.counts.is_empty() {
            return format!("{} items", self.total());
        }
        let counts = self
            .counts
            .iter()
            .map(|(label, count)| format!("{label}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} items: {counts}", self.total())
    }
}

/// Severity used when forwarding a taxonomy line to `tracing`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

/// Taxonomy lines for one outcome, without timestamps
pub fn render_outcome(outcome: &ItemOutcome) -> Vec<String> {
    render_outcome_leveled(outcome)
        .into_iter()
        .map(|(_, line)| line)
        .collect()
}

fn render_outcome_leveled(outcome: &ItemOutcome) -> Vec<(Level, String)> {
    let target = outcome.reference.key();
    let mut lines = vec![(Level::Info, format!("Processing: {target}"))];

    // Only a submitted replacement counts as re-encrypted
    if outcome.final_state == ItemState::Committed {
        lines.push((Level::Info, format!("SUCCESS: Re-encrypted {target}")));
        lines.push((Level::Info, format!("VERIFIED: Ciphertext updated {target}")));
    }

    match outcome.final_state {
        ItemState::Failed(kind) => {
            let message = outcome.last_error.as_deref().unwrap_or("no details");
            lines.push((
                Level::Error,
                format!("ERROR: Failed to apply {target} ({kind}: {message})"),
            ));
        }
        ItemState::Skipped(SkipReason::NoDecryptedSecret) => {
            let expected = outcome
                .expected_secret_name
                .as_deref()
                .unwrap_or(&outcome.reference.name);
            lines.push((
                Level::Warn,
                format!("WARNING: Decrypted secret not found {target} (expected Secret '{expected}')"),
            ));
        }
        ItemState::Skipped(SkipReason::DryRun) => {
            lines.push((
                Level::Info,
                format!("INFO: Dry run, resealed and verified {target} but not submitted"),
            ));
        }
        ItemState::Skipped(reason) => {
            lines.push((
                Level::Info,
                format!("INFO: Skipped ({}) {target}", reason.as_str()),
            ));
        }
        _ => {}
    }
    lines
}

/// Builds the run report from outcomes delivered in any order
#[derive(Debug)]
pub struct Reporter {
    report: RunReport,
    pending: BTreeMap<usize, ItemOutcome>,
    next_index: usize,
    log: Option<File>,
    /// Stamped lines not yet appended to `log`
    unflushed: Vec<String>,
}

impl Reporter {
    /// Create a reporter, opening `log_path` for appending if given
    pub async fn new(
        key_fingerprint: Option<String>,
        dry_run: bool,
        log_path: Option<&Path>,
    ) -> std::io::Result<Self> {
        let log = match log_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Some(OpenOptions::new().create(true).append(true).open(path).await?)
            }
            None => None,
        };
        Ok(Self {
            report: RunReport::new(Uuid::new_v4(), key_fingerprint, dry_run),
            pending: BTreeMap::new(),
            next_index: 0,
            log,
            unflushed: Vec::new(),
        })
    }

    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.report.run_id
    }

    /// Emit the `START` line
    pub fn start(&mut self, scope: &str) {
        let key = self
            .report
            .key_fingerprint
            .as_deref()
            .map(|fp| format!(" (key {})", &fp[..fp.len().min(12)]))
            .unwrap_or_default();
        let mode = if self.report.dry_run { " [dry-run]" } else { "" };
        self.emit(
            Level::Info,
            format!("START: Re-encrypting SealedSecrets in {scope}{key}{mode}"),
        );
    }

    /// Record the outcome of the item listed at `index`
    ///
    /// Outcomes arriving ahead of earlier items are held back until the gap
    /// is filled, so lines and outcomes follow discovery order.
    pub fn record(&mut self, index: usize, outcome: ItemOutcome) {
        self.pending.insert(index, outcome);
        while let Some(outcome) = self.pending.remove(&self.next_index) {
            self.append(outcome);
            self.next_index += 1;
        }
    }

    /// Mark the run as aborted
    pub fn abort(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.report.abort_reason.is_none() {
            self.emit(Level::Error, format!("ERROR: Run aborted ({reason})"));
            self.report.abort_reason = Some(reason);
        }
    }

    /// Append emitted lines to the `--log` file
    ///
    /// A write failure disables the file for the rest of the run; the lines
    /// still reach `tracing` and the report.
    pub async fn flush_log(&mut self) {
        let lines = std::mem::take(&mut self.unflushed);
        let Some(file) = self.log.as_mut() else {
            return;
        };
        if lines.is_empty() {
            return;
        }
        let mut chunk = lines.join("\n");
        chunk.push('\n');
        let written = match file.write_all(chunk.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(error = %e, "Failed to write run log; further lines go to stderr only");
            self.log = None;
        }
    }

    /// Flush held-back outcomes, emit `END` and the summary, and return the report
    pub async fn finalize(mut self, peak_active_engines: usize) -> RunReport {
        let pending = std::mem::take(&mut self.pending);
        for (_, outcome) in pending {
            self.append(outcome);
        }
        self.report.peak_active_engines = peak_active_engines;
        self.report.ended = Some(Utc::now());

        let end = if self.report.abort_reason.is_some() {
            "END: Re-encryption aborted"
        } else {
            "END: Re-encryption finished"
        };
        self.emit(Level::Info, end.to_string());
        let summary = format!("SUMMARY: {}", self.report.summary());
        let level = match self.report.exit_code() {
            0 => Level::Info,
            1 => Level::Warn,
            _ => Level::Error,
        };
        self.emit(level, summary);
        self.flush_log().await;
        self.report
    }

    /// Run the reporter on its own task, fed by the returned sender
    ///
    /// The task ends when every sender is dropped and yields the reporter
    /// for [`Reporter::finalize`].
    pub fn spawn(self) -> (mpsc::Sender<ReportEvent>, JoinHandle<Reporter>) {
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            let mut reporter = self;
            while let Some(event) = rx.recv().await {
                match event {
                    ReportEvent::Outcome { index, outcome } => reporter.record(index, outcome),
                    ReportEvent::Abort { reason } => reporter.abort(reason),
                }
                reporter.flush_log().await;
            }
            reporter
        });
        (tx, handle)
    }

    fn append(&mut self, outcome: ItemOutcome) {
        for (level, line) in render_outcome_leveled(&outcome) {
            self.emit(level, line);
        }
        let label = outcome.final_state.label();
        metrics::increment_items(&label);
        *self.report.counts.entry(label).or_insert(0) += 1;
        self.report.outcomes.push(outcome);
    }

    fn emit(&mut self, level: Level, line: String) {
        match level {
            Level::Info => info!(target: "ssrctl::report", "{line}"),
            Level::Warn => warn!(target: "ssrctl::report", "{line}"),
            Level::Error => error!(target: "ssrctl::report", "{line}"),
        }
        let stamped = format!(
            "[{}] {line}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        if self.log.is_some() {
            self.unflushed.push(stamped.clone());
        }
        self.report.lines.push(stamped);
    }
}

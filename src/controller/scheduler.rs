//! # Scheduler
//!
//! Fans engine passes out over a bounded pool. A [`Semaphore`] caps the
//! number of active engines; each item runs on its own task with panics
//! caught at the item boundary, so one item can never take down another.
//!
//! A fatal outcome (cluster unreachable) cancels the run. In-flight items
//! then finish as `Failed(Cancelled)` and items not yet started are reported
//! as `Skipped(Cancelled)`.

use crate::cluster::SealedSecretRef;
use crate::controller::engine::{Engine, ItemOutcome, ReencryptionItem};
use crate::controller::reporter::{ReportEvent, Reporter, RunReport};
use crate::observability::metrics;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Tracks current and peak number of active engines
#[derive(Debug, Default)]
pub struct ActivityGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ActivityGauge {
    /// Mark one engine active until the returned guard is dropped
    pub fn enter(self: &Arc<Self>) -> ActivityGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        metrics::increment_engines_active();
        ActivityGuard {
            gauge: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the gauge on drop
#[derive(Debug)]
pub struct ActivityGuard {
    gauge: Arc<ActivityGauge>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        metrics::decrement_engines_active();
    }
}

/// Bounded-concurrency driver for a run
#[derive(Debug)]
pub struct Scheduler {
    engine: Engine,
    max_attempts: u32,
    key_max_age: Option<Duration>,
    gauge: Arc<ActivityGauge>,
}

impl Scheduler {
    pub fn new(engine: Engine, max_attempts: u32) -> Self {
        Self {
            engine,
            max_attempts: max_attempts.max(1),
            key_max_age: None,
            gauge: Arc::new(ActivityGauge::default()),
        }
    }

    /// Warn at the end of the run if the key is older than `max_age`
    #[must_use]
    pub fn with_key_max_age(mut self, max_age: Duration) -> Self {
        self.key_max_age = Some(max_age);
        self
    }

    #[must_use]
    pub fn gauge(&self) -> Arc<ActivityGauge> {
        Arc::clone(&self.gauge)
    }

    /// Process `items` with at most `concurrency_limit` engines active at once
    ///
    /// Outcomes are delivered to `reporter` as they complete; the returned
    /// report lists them in the order of `items`.
    pub async fn run(
        &self,
        items: Vec<ReencryptionItem>,
        concurrency_limit: usize,
        reporter: Reporter,
    ) -> RunReport {
        let limit = concurrency_limit.max(1);
        let cancel = self.engine.context().cancel.clone();
        let semaphore = Arc::new(Semaphore::new(limit));
        let (tx, reporter_task) = reporter.spawn();
        let mut tasks = JoinSet::new();
        let mut not_started: Vec<(usize, SealedSecretRef)> = Vec::new();

        info!(items = items.len(), concurrency = limit, "Dispatching items");

        for (index, item) in items.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                not_started.push((index, item.reference));
                continue;
            };

            let engine = self.engine.clone();
            let gauge = Arc::clone(&self.gauge);
            let tx = tx.clone();
            let max_attempts = self.max_attempts;
            tasks.spawn(async move {
                let _permit = permit;
                let _active = gauge.enter();
                let outcome = run_item(&engine, item, max_attempts).await;

                let cancel = &engine.context().cancel;
                if let Some(kind) = outcome.error_kind().filter(|k| k.is_fatal()) {
                    if !cancel.is_cancelled() {
                        let reason = format!(
                            "{kind} while processing {}: {}",
                            outcome.reference,
                            outcome.last_error.as_deref().unwrap_or("no details")
                        );
                        error!("Aborting run: {reason}");
                        send(&tx, ReportEvent::Abort { reason }).await;
                        cancel.cancel();
                    }
                }
                send(&tx, ReportEvent::Outcome { index, outcome }).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Engine task did not complete: {e}");
            }
        }

        if !not_started.is_empty() {
            warn!(count = not_started.len(), "Items not started because the run was cancelled");
        }
        for (index, reference) in not_started {
            send(
                &tx,
                ReportEvent::Outcome {
                    index,
                    outcome: ItemOutcome::not_started(reference),
                },
            )
            .await;
        }
        drop(tx);

        let peak = self.gauge.peak();
        let report = match reporter_task.await {
            Ok(reporter) => reporter.finalize(peak).await,
            Err(e) => {
                error!("Reporter task failed: {e}");
                RunReport::aborted(self.engine.context().settings.dry_run, e.to_string())
            }
        };

        if let Some(max_age) = self.key_max_age {
            let key = &self.engine.context().key;
            if key.is_stale(Utc::now(), max_age) {
                warn!(
                    fingerprint = %key.short_fingerprint(),
                    fetched_at = %key.fetched_at,
                    "Run outlived the key max age; re-run to pick up a key rotated during this run"
                );
            }
        }
        report
    }
}

/// One item with pre-write conflict retries and panic isolation
async fn run_item(engine: &Engine, item: ReencryptionItem, max_attempts: u32) -> ItemOutcome {
    let mut item = item;
    loop {
        let reference = item.reference.clone();
        let attempts = item.attempts;
        let outcome = match AssertUnwindSafe(engine.process(item.clone()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(resource = %reference, "Engine panicked: {message}");
                ItemOutcome::panicked(reference, attempts, message)
            }
        };

        if outcome.should_retry(max_attempts) && !engine.context().cancel.is_cancelled() {
            info!(
                resource = %outcome.reference,
                attempt = attempts + 1,
                max_attempts,
                "Retrying after concurrent modification"
            );
            item = item.next_attempt();
            continue;
        }
        return outcome;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn send(tx: &mpsc::Sender<ReportEvent>, event: ReportEvent) {
    if let Err(e) = tx.send(event).await {
        debug!("Reporter channel closed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_gauge_tracks_peak() {
        let gauge = Arc::new(ActivityGauge::default());
        let first = gauge.enter();
        let second = gauge.enter();
        assert_eq!(gauge.current(), 2);
        drop(first);
        let third = gauge.enter();
        assert_eq!(gauge.current(), 2);
        drop(second);
        drop(third);
        assert_eq!(gauge.current(), 0);
        assert_eq!(gauge.peak(), 2);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}

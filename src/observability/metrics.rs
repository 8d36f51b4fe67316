//! # Metrics
//!
//! Prometheus metrics for re-encryption runs.
//!
//! `ssrctl` is a one-shot command, so metrics are not scraped; with
//! `--metrics-file` they are written at the end of the run in the text
//! format read by the node-exporter textfile collector.
//!
//! ## Metrics Exposed
//!
//! - `sealed_secret_reencrypt_items_total{state}` - Items by terminal state
//! - `sealed_secret_reencrypt_runs_total{result}` - Runs by result (`success`, `failed`, `aborted`)
//! - `sealed_secret_reencrypt_read_retries_total` - Retried cluster reads
//! - `sealed_secret_reencrypt_engines_active` - Engine instances currently running
//! - `sealed_secret_reencrypt_reseal_duration_seconds` - Duration of reseal invocations
//! - `sealed_secret_reencrypt_commit_duration_seconds` - Duration of guarded updates
//! - `sealed_secret_reencrypt_item_duration_seconds` - End-to-end duration of one item

use anyhow::{Context, Result};
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::path::Path;
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static ITEMS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "sealed_secret_reencrypt_items_total",
            "Total number of processed SealedSecrets by terminal state",
        ),
        &["state"],
    )
    .expect("Failed to create ITEMS_TOTAL metric - this should never happen")
});

static RUNS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "sealed_secret_reencrypt_runs_total",
            "Total number of re-encryption runs by result",
        ),
        &["result"],
    )
    .expect("Failed to create RUNS_TOTAL metric - this should never happen")
});

static READ_RETRIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "sealed_secret_reencrypt_read_retries_total",
        "Total number of retried cluster reads after transient failures",
    )
    .expect("Failed to create READ_RETRIES_TOTAL metric - this should never happen")
});

static ENGINES_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "sealed_secret_reencrypt_engines_active",
        "Number of engine instances currently processing an item",
    )
    .expect("Failed to create ENGINES_ACTIVE metric - this should never happen")
});

static RESEAL_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "sealed_secret_reencrypt_reseal_duration_seconds",
            "Duration of reseal invocations in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
    )
    .expect("Failed to create RESEAL_DURATION metric - this should never happen")
});

static COMMIT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "sealed_secret_reencrypt_commit_duration_seconds",
            "Duration of guarded SealedSecret updates in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
    )
    .expect("Failed to create COMMIT_DURATION metric - this should never happen")
});

static ITEM_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "sealed_secret_reencrypt_item_duration_seconds",
            "End-to-end duration of one item in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("Failed to create ITEM_DURATION metric - this should never happen")
});

/// Register all metrics with the crate registry
///
/// Registering twice is not an error, so library callers and the binary can
/// both call this.
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ITEMS_TOTAL.clone()),
        Box::new(RUNS_TOTAL.clone()),
        Box::new(READ_RETRIES_TOTAL.clone()),
        Box::new(ENGINES_ACTIVE.clone()),
        Box::new(RESEAL_DURATION.clone()),
        Box::new(COMMIT_DURATION.clone()),
        Box::new(ITEM_DURATION.clone()),
    ];
    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub fn increment_items(state_label: &str) {
    ITEMS_TOTAL.with_label_values(&[state_label]).inc();
}

pub fn increment_runs(result: &str) {
    RUNS_TOTAL.with_label_values(&[result]).inc();
}

pub fn increment_read_retries() {
    READ_RETRIES_TOTAL.inc();
}

pub fn increment_engines_active() {
    ENGINES_ACTIVE.inc();
}

pub fn decrement_engines_active() {
    ENGINES_ACTIVE.dec();
}

pub fn observe_reseal_duration(duration: f64) {
    RESEAL_DURATION.observe(duration);
}

pub fn observe_commit_duration(duration: f64) {
    COMMIT_DURATION.observe(duration);
}

pub fn observe_item_duration(duration: f64) {
    ITEM_DURATION.observe(duration);
}

/// Render the registry in the Prometheus text format
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn render_text() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
}

/// Write the registry to `path` for the textfile collector
///
/// The file is written next to its destination and renamed into place so
/// the collector never reads a partial file.
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn write_textfile(path: &Path) -> Result<()> {
    let text = render_text()?;
    let tmp = path.with_extension("prom.tmp");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&tmp, text).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move metrics file to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_twice() {
        assert!(register_metrics().is_ok());
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_increment_items() {
        let before = ITEMS_TOTAL.with_label_values(&["Committed"]).get();
        increment_items("Committed");
        let after = ITEMS_TOTAL.with_label_values(&["Committed"]).get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_increment_runs() {
        let before = RUNS_TOTAL.with_label_values(&["success"]).get();
        increment_runs("success");
        let after = RUNS_TOTAL.with_label_values(&["success"]).get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_increment_read_retries() {
        let before = READ_RETRIES_TOTAL.get();
        increment_read_retries();
        assert_eq!(READ_RETRIES_TOTAL.get(), before + 1u64);
    }

    #[test]
    fn test_observe_durations() {
        observe_reseal_duration(0.2);
        observe_commit_duration(0.1);
        observe_item_duration(1.5);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_write_textfile() {
        register_metrics().expect("register");
        increment_items("Skipped(DryRun)");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("ssrctl.prom");
        write_textfile(&path).expect("write metrics");

        let text = std::fs::read_to_string(&path).expect("read metrics");
        assert!(text.contains("sealed_secret_reencrypt_items_total"));
        assert!(!path.with_extension("prom.tmp").exists());
    }
}

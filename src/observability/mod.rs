//! # Observability
//!
//! - `metrics`: Prometheus metrics collection and textfile export
//!
//! Structured logging is configured in [`crate::runtime::initialization`].

pub mod metrics;

// Re-export for convenience
pub use metrics::*;

//! # Controller
//!
//! Core re-encryption modules.
//!
//! - `audit`: On-disk copies of resealed objects and the run report
//! - `backoff`: Fibonacci backoff for transient read retries
//! - `engine`: Per-item state machine
//! - `fingerprint`: Certificate and ciphertext fingerprints
//! - `reporter`: Outcome aggregation and log taxonomy
//! - `reseal`: The resealing primitive (`kubeseal`)
//! - `scheduler`: Bounded-concurrency driver
//! - `scratch`: Scoped temporary storage

pub mod audit;
pub mod backoff;
pub mod engine;
pub mod fingerprint;
pub mod reporter;
pub mod reseal;
pub mod scheduler;
pub mod scratch;

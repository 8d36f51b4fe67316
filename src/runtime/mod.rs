//! # Runtime
//!
//! Process setup and the top-level run.
//!
//! - `initialization`: rustls provider, tracing subscriber, Kubernetes client
//! - `run`: discovery, key fetch, scheduling and report persistence

pub mod initialization;
pub mod run;

pub use run::{run_reencryption, Collaborators, RunError, RunSettings};

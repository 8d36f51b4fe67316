//! # Configuration
//!
//! Run-level settings loaded from environment variables and overridden by CLI flags.

mod reencrypt;

pub use reencrypt::{ConfigError, ReencryptConfig};

//! # Re-encryption Configuration
//!
//! Settings for a single re-encryption run.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration values
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("concurrency must be at least 1 (got {0})")]
    Concurrency(usize),
    #[error("max attempts must be at least 1 (got {0})")]
    MaxAttempts(u32),
    #[error("read attempts must be at least 1 (got {0})")]
    ReadAttempts(u32),
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("backoff start ({start_ms}ms) exceeds backoff max ({max_ms}ms)")]
    Backoff { start_ms: u64, max_ms: u64 },
}

/// Re-encryption run configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// CLI flags are applied on top of the environment by the `ssrctl` binary.
#[derive(Debug, Clone)]
pub struct ReencryptConfig {
    /// Namespace the sealed-secrets controller runs in
    pub controller_namespace: String,
    /// Service name of the sealed-secrets controller
    pub controller_name: String,
    /// Certificate location override (file path or http(s) URL)
    /// When unset the certificate is fetched from the controller Service
    pub cert: Option<String>,
    /// Maximum number of items processed at the same time
    pub concurrency: usize,
    /// Pipeline passes per item; only pre-write conflicts are retried
    pub max_attempts: u32,
    /// Per-call timeout for Kubernetes API calls (seconds)
    pub call_timeout_secs: u64,
    /// Timeout for one kubeseal invocation (seconds)
    pub reseal_timeout_secs: u64,
    /// Attempts for transient read failures before giving up
    pub read_attempts: u32,
    /// Fibonacci backoff starting value for read retries (milliseconds)
    pub backoff_start_ms: u64,
    /// Fibonacci backoff maximum value for read retries (milliseconds)
    pub backoff_max_ms: u64,
    /// Certificate age after which a warning is emitted (seconds)
    pub key_max_age_secs: u64,
    /// Page size used when listing SealedSecrets
    pub list_page_size: u32,
    /// kubeseal binary name or path
    pub kubeseal_binary: String,
    /// Validate and reseal without submitting updates
    pub dry_run: bool,
    /// Reseal objects already annotated with the current key fingerprint
    pub force: bool,
    /// Directory receiving audit copies of resealed objects and the run report
    pub output_dir: Option<PathBuf>,
    /// File the taxonomy log lines are appended to
    pub log_path: Option<PathBuf>,
    /// Explicit path for the JSON run report
    pub report_path: Option<PathBuf>,
    /// Prometheus textfile written at the end of the run
    pub metrics_file: Option<PathBuf>,
}

impl Default for ReencryptConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_string(),
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            cert: None,
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            reseal_timeout_secs: DEFAULT_RESEAL_TIMEOUT_SECS,
            read_attempts: DEFAULT_READ_ATTEMPTS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            key_max_age_secs: DEFAULT_KEY_MAX_AGE_SECS,
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
            kubeseal_binary: DEFAULT_KUBESEAL_BINARY.to_string(),
            dry_run: false,
            force: false,
            output_dir: None,
            log_path: None,
            report_path: None,
            metrics_file: None,
        }
    }
}

impl ReencryptConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            controller_namespace: env_var_or_default_str(
                "SSR_CONTROLLER_NAMESPACE",
                DEFAULT_CONTROLLER_NAMESPACE,
            ),
            controller_name: env_var_or_default_str("SSR_CONTROLLER_NAME", DEFAULT_CONTROLLER_NAME),
            cert: std::env::var("SSR_CERT").ok().filter(|v| !v.trim().is_empty()),
            concurrency: env_var_or_default("SSR_CONCURRENCY", DEFAULT_CONCURRENCY),
            max_attempts: env_var_or_default("SSR_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            call_timeout_secs: env_var_or_default("SSR_CALL_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT_SECS),
            reseal_timeout_secs: env_var_or_default(
                "SSR_RESEAL_TIMEOUT_SECS",
                DEFAULT_RESEAL_TIMEOUT_SECS,
            ),
            read_attempts: env_var_or_default("SSR_READ_ATTEMPTS", DEFAULT_READ_ATTEMPTS),
            backoff_start_ms: env_var_or_default("SSR_BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("SSR_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            key_max_age_secs: env_var_or_default("SSR_KEY_MAX_AGE_SECS", DEFAULT_KEY_MAX_AGE_SECS),
            list_page_size: env_var_or_default("SSR_LIST_PAGE_SIZE", DEFAULT_LIST_PAGE_SIZE),
            kubeseal_binary: env_var_or_default_str("SSR_KUBESEAL_BINARY", DEFAULT_KUBESEAL_BINARY),
            dry_run: env_var_or_default_bool("SSR_DRY_RUN", false),
            force: env_var_or_default_bool("SSR_FORCE", false),
            output_dir: std::env::var("SSR_OUTPUT_DIR").ok().map(PathBuf::from),
            log_path: None,
            report_path: None,
            metrics_file: std::env::var("SSR_METRICS_FILE").ok().map(PathBuf::from),
        }
    }

    /// Reject values the scheduler and engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Concurrency(self.concurrency));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::MaxAttempts(self.max_attempts));
        }
        if self.read_attempts == 0 {
            return Err(ConfigError::ReadAttempts(self.read_attempts));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "call timeout",
            });
        }
        if self.reseal_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "reseal timeout",
            });
        }
        if self.backoff_start_ms > self.backoff_max_ms {
            return Err(ConfigError::Backoff {
                start_ms: self.backoff_start_ms,
                max_ms: self.backoff_max_ms,
            });
        }
        Ok(())
    }

    /// Get per-call timeout duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Get kubeseal timeout duration
    pub fn reseal_timeout(&self) -> Duration {
        Duration::from_secs(self.reseal_timeout_secs)
    }

    /// Get backoff start duration
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    /// Get backoff max duration
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Get certificate staleness threshold
    pub fn key_max_age(&self) -> Duration {
        Duration::from_secs(self.key_max_age_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ReencryptConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.controller_namespace, "kube-system");
        assert_eq!(config.controller_name, "sealed-secrets-controller");
        assert!(!config.dry_run);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = ReencryptConfig {
            concurrency: 0,
            ..ReencryptConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Concurrency(0)));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let config = ReencryptConfig {
            max_attempts: 0,
            ..ReencryptConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MaxAttempts(0)));
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let config = ReencryptConfig {
            backoff_start_ms: 10_000,
            backoff_max_ms: 100,
            ..ReencryptConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Backoff { .. })
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ReencryptConfig {
            call_timeout_secs: 0,
            ..ReencryptConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                field: "call timeout"
            })
        );
    }

    #[test]
    fn test_durations() {
        let config = ReencryptConfig::default();
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.reseal_timeout(), Duration::from_secs(60));
        assert_eq!(config.backoff_start_duration(), Duration::from_millis(250));
        assert_eq!(config.backoff_max_duration(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_parse_bool() {
        for value in ["true", "TRUE", "1", "yes", "on", " On "] {
            assert!(parse_bool(value), "{value} should parse as true");
        }
        for value in ["false", "0", "no", "off", ""] {
            assert!(!parse_bool(value), "{value} should parse as false");
        }
    }
}

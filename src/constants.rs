//! # Constants
//!
//! Shared constants used throughout the re-encryption run.
//!
//! These values represent reasonable defaults and can be overridden via
//! environment variables or CLI flags where applicable.

/// Namespace the sealed-secrets controller is installed into by its Helm chart
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "kube-system";

/// Service name of the sealed-secrets controller
pub const DEFAULT_CONTROLLER_NAME: &str = "sealed-secrets-controller";

/// Default number of SealedSecrets processed concurrently
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of pipeline passes per item (1 = no retry)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Default per-call timeout for Kubernetes API calls (seconds)
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Default timeout for a single kubeseal invocation (seconds)
pub const DEFAULT_RESEAL_TIMEOUT_SECS: u64 = 60;

/// Default number of attempts for transient read failures
pub const DEFAULT_READ_ATTEMPTS: u32 = 3;

/// Default Fibonacci backoff starting value for read retries (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 250;

/// Default Fibonacci backoff maximum value for read retries (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5_000;

/// Age after which a fetched certificate is reported as stale (seconds)
pub const DEFAULT_KEY_MAX_AGE_SECS: u64 = 900;

/// Page size used when listing SealedSecrets
pub const DEFAULT_LIST_PAGE_SIZE: u32 = 250;

/// Name of the kubeseal binary looked up in PATH
pub const DEFAULT_KUBESEAL_BINARY: &str = "kubeseal";

/// Certificate path served by the sealed-secrets controller
pub const CONTROLLER_CERT_PATH: &str = "/v1/cert.pem";

/// Field manager recorded on updates made by this tool
pub const FIELD_MANAGER: &str = "ssrctl";

/// Annotation recording the fingerprint of the certificate an object was last resealed with
pub const KEY_FINGERPRINT_ANNOTATION: &str =
    "reencrypt.sealedsecrets.octopilot.io/key-fingerprint";

/// Annotation recording when an object was last resealed (RFC3339)
pub const REENCRYPTED_AT_ANNOTATION: &str = "reencrypt.sealedsecrets.octopilot.io/reencrypted-at";

/// sealed-secrets annotation selecting namespace-wide sealing scope
pub const NAMESPACE_WIDE_ANNOTATION: &str = "sealedsecrets.bitnami.com/namespace-wide";

/// sealed-secrets annotation selecting cluster-wide sealing scope
pub const CLUSTER_WIDE_ANNOTATION: &str = "sealedsecrets.bitnami.com/cluster-wide";

/// File name of the JSON run report written into the output directory
pub const REPORT_FILE_NAME: &str = "report.json";

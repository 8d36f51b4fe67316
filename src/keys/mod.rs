//! # Key Provider
//!
//! Fetches the sealed-secrets controller's current public-key certificate
//! once per run and shares it read-only with every engine instance.
//!
//! The certificate comes from one of three [`KeySource`]s:
//!
//! - the controller Service, through the API server's service proxy (default)
//! - a local PEM file
//! - an HTTP(S) URL
//!
//! A mid-run key rotation is not observed; the next run re-fetches.

mod source;

pub use source::{CertLocation, ControllerServiceSource, FileSource, UrlSource};

use crate::controller::fingerprint::sha256_hex;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Errors fetching or parsing the controller certificate
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyFetchError {
    #[error("certificate source {source_desc} unreachable: {message}")]
    Unreachable {
        source_desc: String,
        message: String,
    },
    #[error("certificate from {source_desc} is malformed: {reason}")]
    Malformed { source_desc: String, reason: String },
    #[error("failed to read certificate file {path}: {message}")]
    Io { path: String, message: String },
}

/// The controller's public key as fetched at the start of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyMaterial {
    /// Lowercase hex SHA-256 of the DER certificate
    pub fingerprint: String,
    /// PEM bytes exactly as served
    pub pem: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    /// Human-readable description of where the certificate came from
    pub source: String,
}

impl PublicKeyMaterial {
    /// Parse `pem` and derive its fingerprint
    pub fn from_pem(
        pem: Vec<u8>,
        source: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, KeyFetchError> {
        let source = source.into();
        let der = parse_certificate_pem(&pem).map_err(|reason| KeyFetchError::Malformed {
            source_desc: source.clone(),
            reason,
        })?;
        Ok(Self {
            fingerprint: sha256_hex(&der),
            pem,
            fetched_at,
            source,
        })
    }

    /// Whether the certificate is older than `max_age` at `now`
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let age = now.signed_duration_since(self.fetched_at);
        age.to_std().is_ok_and(|age| age > max_age)
    }

    /// First 12 hex characters of the fingerprint, for log lines
    #[must_use]
    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..self.fingerprint.len().min(12)]
    }
}

/// Decode the first `CERTIFICATE` block of `pem` into DER bytes
pub fn parse_certificate_pem(pem: &[u8]) -> Result<Vec<u8>, String> {
    let text = std::str::from_utf8(pem).map_err(|_utf8| "certificate is not UTF-8".to_string())?;
    if text.trim().is_empty() {
        return Err("empty response".to_string());
    }
    let begin = text
        .find(PEM_BEGIN)
        .ok_or_else(|| "no PEM CERTIFICATE block".to_string())?;
    let body_start = begin + PEM_BEGIN.len();
    let end = text[body_start..]
        .find(PEM_END)
        .ok_or_else(|| "unterminated PEM CERTIFICATE block".to_string())?;
    let body: String = text[body_start..body_start + end]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if body.is_empty() {
        return Err("empty PEM CERTIFICATE block".to_string());
    }
    STANDARD
        .decode(body.as_bytes())
        .map_err(|e| format!("invalid base64 in certificate body: {e}"))
}

/// Where the controller certificate is fetched from
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Return the raw PEM bytes
    async fn fetch_pem(&self, controller_namespace: &str) -> Result<Vec<u8>, KeyFetchError>;

    /// Description recorded in [`PublicKeyMaterial::source`]
    fn describe(&self, controller_namespace: &str) -> String;
}

/// Run-scoped certificate cache
///
/// Concurrent first callers share a single fetch.
pub struct KeyProvider {
    source: Arc<dyn KeySource>,
    cached: OnceCell<Arc<PublicKeyMaterial>>,
}

impl std::fmt::Debug for KeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyProvider")
            .field("cached", &self.cached.get().map(|k| k.fingerprint.clone()))
            .finish_non_exhaustive()
    }
}

impl KeyProvider {
    pub fn new(source: Arc<dyn KeySource>) -> Self {
        Self {
            source,
            cached: OnceCell::new(),
        }
    }

    /// Current public key, fetched on first use and cached for the rest of the run
    pub async fn current_public_key(
        &self,
        controller_namespace: &str,
    ) -> Result<Arc<PublicKeyMaterial>, KeyFetchError> {
        self.cached
            .get_or_try_init(|| async {
                let pem = self.source.fetch_pem(controller_namespace).await?;
                let material = PublicKeyMaterial::from_pem(
                    pem,
                    self.source.describe(controller_namespace),
                    Utc::now(),
                )?;
                info!(
                    fingerprint = %material.fingerprint,
                    source = %material.source,
                    "Fetched controller certificate"
                );
                Ok(Arc::new(material))
            })
            .await
            .map(Arc::clone)
    }

    /// Where the certificate is fetched from
    #[must_use]
    pub fn describe(&self, controller_namespace: &str) -> String {
        self.source.describe(controller_namespace)
    }
}

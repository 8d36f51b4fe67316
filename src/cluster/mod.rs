//! # Cluster Access
//!
//! Typed interfaces to the Kubernetes API used by a re-encryption run.
//!
//! - [`ClusterReader`] lists SealedSecrets and reads SealedSecrets and Secrets
//! - [`ClusterWriter`] performs the dry-run submission and the guarded update
//!
//! [`KubeCluster`] implements both against a live API server. Tests supply
//! in-memory implementations.

mod client;

pub use client::KubeCluster;

use crate::crd::{SealedSecret, SealedSecretSpecSummary};
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Secret;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Identity of a SealedSecret plus the resourceVersion it was read at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedSecretRef {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl SealedSecretRef {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        resource_version: Option<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            resource_version,
        }
    }

    /// `namespace/name`
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Same identity, different resourceVersion
    #[must_use]
    pub fn at_version(&self, resource_version: Option<String>) -> Self {
        Self {
            resource_version,
            ..self.clone()
        }
    }
}

impl fmt::Display for SealedSecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Errors surfaced by cluster calls
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Transport failure, 5xx or 429; worth retrying
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
    /// Object does not exist (expected in several states, not a failure by itself)
    #[error("{kind} '{namespace}/{name}' not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    /// resourceVersion precondition failed (HTTP 409)
    #[error("conflict on '{resource}': {message}")]
    Conflict { resource: String, message: String },
    /// Request refused by authorization or admission
    #[error("rejected by API server ({code}): {message}")]
    Rejected { code: u16, message: String },
    /// The call did not finish within the per-call timeout
    #[error("cluster call timed out after {0:?}")]
    Timeout(Duration),
}

impl ClusterError {
    /// Transient failures that a retry may resolve
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Unreachable(_) | ClusterError::Timeout(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// Read access to SealedSecrets and their decrypted Secrets
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Lazily enumerate SealedSecrets, in one namespace or across all of them
    ///
    /// Every call starts a fresh listing; nothing is cached between calls.
    fn list_sealed_secrets<'a>(
        &'a self,
        namespace: Option<&'a str>,
    ) -> BoxStream<'a, Result<SealedSecretRef, ClusterError>>;

    /// Fetch the full SealedSecret object
    async fn fetch_sealed_secret(
        &self,
        reference: &SealedSecretRef,
    ) -> Result<SealedSecret, ClusterError>;

    /// Fetch a Secret; `Ok(None)` when it does not exist
    async fn fetch_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, ClusterError>;
}

/// Write access used by the engine's validation and commit steps
#[async_trait]
pub trait ClusterWriter: Send + Sync {
    /// Submit `object` through admission without persisting it
    async fn dry_run_update(&self, object: &SealedSecret) -> Result<(), ClusterError>;

    /// Replace `object`, guarded by its `metadata.resourceVersion`
    async fn update_sealed_secret(&self, object: &SealedSecret)
        -> Result<SealedSecret, ClusterError>;
}

/// Full cluster access required by the engine
pub trait Cluster: ClusterReader + ClusterWriter {}

impl<T: ClusterReader + ClusterWriter> Cluster for T {}

/// Ciphertext fingerprint and target Secret name of a fetched SealedSecret
pub fn fetch_sealed_secret_spec(object: &SealedSecret) -> SealedSecretSpecSummary {
    object.spec_summary()
}

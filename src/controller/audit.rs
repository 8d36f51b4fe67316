//! # Audit Writer
//!
//! Writes a copy of every resealed SealedSecret to
//! `<output-dir>/<namespace>/<name>.yaml` before it is submitted, and the
//! JSON run report at the end of the run.
//!
//! Only ciphertext is written; the plaintext never reaches this module.

use crate::cluster::SealedSecretRef;
use crate::crd::SealedSecret;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("failed to write {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to serialize {what}: {message}")]
    Serialize { what: &'static str, message: String },
}

/// Audit output rooted at the configured output directory
#[derive(Debug, Clone)]
pub struct AuditWriter {
    root: PathBuf,
}

impl AuditWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination of the audit copy for `reference`
    #[must_use]
    pub fn item_path(&self, reference: &SealedSecretRef) -> PathBuf {
        self.root
            .join(&reference.namespace)
            .join(format!("{}.yaml", reference.name))
    }

    /// Write the resealed object as YAML, replacing any earlier copy
    pub async fn write_resealed(
        &self,
        reference: &SealedSecretRef,
        object: &SealedSecret,
    ) -> Result<PathBuf, AuditError> {
        let path = self.item_path(reference);
        let yaml = serde_yaml::to_string(object).map_err(|e| AuditError::Serialize {
            what: "SealedSecret",
            message: e.to_string(),
        })?;
        write_file(&path, yaml.as_bytes()).await?;
        debug!(path = %path.display(), "Wrote audit copy");
        Ok(path)
    }

    /// Write `value` as pretty JSON to `path`
    pub async fn write_json<T: Serialize>(
        path: &Path,
        what: &'static str,
        value: &T,
    ) -> Result<(), AuditError> {
        let json = serde_json::to_vec_pretty(value).map_err(|e| AuditError::Serialize {
            what,
            message: e.to_string(),
        })?;
        write_file(path, &json).await
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), AuditError> {
    let io_error = |e: std::io::Error| AuditError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    tokio::fs::write(path, contents).await.map_err(io_error)
}

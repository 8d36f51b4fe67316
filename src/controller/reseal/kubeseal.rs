//! # kubeseal
//!
//! Reseals a Secret by piping its manifest to `kubeseal` on stdin.
//!
//! The controller certificate is written to the item's scratch slot and
//! passed with `--cert`, so kubeseal never contacts the cluster itself.
//! The plaintext manifest is only ever held in memory.

use super::{ResealError, ResealRequest, Resealer};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// [`Resealer`] backed by the `kubeseal` binary
#[derive(Debug, Clone)]
pub struct KubesealResealer {
    binary: String,
    timeout: Duration,
}

impl KubesealResealer {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Resolve the binary in PATH (or as given, if it is a path)
    pub fn locate(&self) -> Result<PathBuf, ResealError> {
        which::which(&self.binary).map_err(|e| {
            ResealError::Unavailable(format!("{} not found: {e}", self.binary))
        })
    }

    async fn run(
        &self,
        binary: PathBuf,
        request: &ResealRequest<'_>,
    ) -> Result<BTreeMap<String, String>, ResealError> {
        let cert_path = request.scratch.path().join("cert.pem");
        tokio::fs::write(&cert_path, &request.key.pem)
            .await
            .map_err(|e| ResealError::Io(format!("failed to write certificate: {e}")))?;

        let manifest = request
            .secret
            .to_manifest_json()
            .map_err(|e| ResealError::Io(format!("failed to encode Secret manifest: {e}")))?;

        let mut cmd = tokio::process::Command::new(&binary);
        cmd.arg("--cert")
            .arg(&cert_path)
            .arg("--format")
            .arg("json")
            .arg("--scope")
            .arg(request.scope.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ResealError::Unavailable(format!("failed to spawn kubeseal: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&manifest)
                .await
                .map_err(|e| ResealError::Io(format!("failed to write to kubeseal stdin: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| ResealError::Io(format!("failed to close kubeseal stdin: {e}")))?;
        }
        drop(manifest);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ResealError::Io(format!("failed to wait for kubeseal: {e}")))?;

        if output.status.success() {
            parse_kubeseal_output(&output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                exit_code = ?output.status.code(),
                stderr = %stderr,
                "kubeseal failed"
            );
            Err(ResealError::Failed {
                exit_code: output.status.code(),
                stderr,
            })
        }
    }
}

#[async_trait]
impl Resealer for KubesealResealer {
    async fn reseal(
        &self,
        request: ResealRequest<'_>,
    ) -> Result<BTreeMap<String, String>, ResealError> {
        let binary = self.locate()?;
        debug!(
            binary = %binary.display(),
            scope = request.scope.as_str(),
            keys = request.secret.keys().len(),
            "Invoking kubeseal"
        );
        // kill_on_drop reaps the child when the timeout drops the future
        tokio::time::timeout(self.timeout, self.run(binary, &request))
            .await
            .map_err(|_elapsed| ResealError::Timeout(self.timeout))?
    }
}

/// Extract `spec.encryptedData` from kubeseal's JSON output
pub fn parse_kubeseal_output(stdout: &[u8]) -> Result<BTreeMap<String, String>, ResealError> {
    let value: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| ResealError::Representation(format!("output is not JSON: {e}")))?;

    if value.get("kind").and_then(|k| k.as_str()).is_some_and(|k| k != "SealedSecret") {
        return Err(ResealError::Representation(
            "output is not a SealedSecret".to_string(),
        ));
    }

    let encrypted = value
        .pointer("/spec/encryptedData")
        .and_then(|d| d.as_object())
        .ok_or_else(|| {
            ResealError::Representation("output has no spec.encryptedData".to_string())
        })?;

    let mut data = BTreeMap::new();
    for (key, ciphertext) in encrypted {
        let ciphertext = ciphertext
            .as_str()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ResealError::Representation(format!("encryptedData.{key} is not a ciphertext string"))
            })?;
        data.insert(key.clone(), ciphertext.to_string());
    }

    if data.is_empty() {
        return Err(ResealError::Representation(
            "output spec.encryptedData is empty".to_string(),
        ));
    }
    Ok(data)
}

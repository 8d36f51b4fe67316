//! # Resealing
//!
//! The resealing primitive encrypts a Secret's plaintext with the controller's
//! public key. The crate never implements the sealing cryptography itself;
//! [`KubesealResealer`] delegates to the `kubeseal` binary.
//!
//! Plaintext lives in [`Zeroizing`] buffers and is wiped when dropped.

mod kubeseal;

pub use kubeseal::{parse_kubeseal_output, KubesealResealer};

use crate::controller::scratch::ScratchSlot;
use crate::crd::SealingScope;
use crate::keys::PublicKeyMaterial;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

/// Decrypted Secret contents handed to the resealer
pub struct PlaintextSecret {
    pub namespace: String,
    pub name: String,
    pub type_: Option<String>,
    data: BTreeMap<String, Zeroizing<Vec<u8>>>,
}

impl fmt::Debug for PlaintextSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaintextSecret")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("type_", &self.type_)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PlaintextSecret {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        type_: Option<String>,
        data: BTreeMap<String, Zeroizing<Vec<u8>>>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            type_,
            data,
        }
    }

    /// Copy the data of a fetched Secret into wiped-on-drop buffers
    ///
    /// `stringData` is write-only in the API and never present on reads.
    pub fn from_secret(secret: &Secret, namespace: &str, name: &str) -> Self {
        let data = secret
            .data
            .as_ref()
            .map(|data| {
                data.iter()
                    .map(|(k, v)| (k.clone(), Zeroizing::new(v.0.clone())))
                    .collect()
            })
            .unwrap_or_default();
        Self::new(namespace, name, secret.type_.clone(), data)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Secret manifest in JSON, as read by `kubeseal` on stdin
    ///
    /// Built directly into a zeroizing buffer so no unwiped copy of the
    /// encoded plaintext is left behind.
    pub fn to_manifest_json(&self) -> Result<Zeroizing<Vec<u8>>, serde_json::Error> {
        let capacity = 512
            + self
                .data
                .iter()
                .map(|(k, v)| k.len() + v.len().div_ceil(3) * 4 + 8)
                .sum::<usize>();
        let mut out = Zeroizing::new(Vec::with_capacity(capacity));

        out.extend_from_slice(br#"{"apiVersion":"v1","kind":"Secret","metadata":{"name":"#);
        serde_json::to_writer(&mut *out, &self.name)?;
        out.extend_from_slice(br#","namespace":"#);
        serde_json::to_writer(&mut *out, &self.namespace)?;
        out.push(b'}');
        if let Some(type_) = &self.type_ {
            out.extend_from_slice(br#","type":"#);
            serde_json::to_writer(&mut *out, type_)?;
        }
        out.extend_from_slice(br#","data":{"#);
        for (i, (key, value)) in self.data.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            serde_json::to_writer(&mut *out, key)?;
            out.extend_from_slice(b":\"");
            let mut encoded = Zeroizing::new(String::with_capacity(value.len().div_ceil(3) * 4));
            STANDARD.encode_string(value.as_slice(), &mut *encoded);
            out.extend_from_slice(encoded.as_bytes());
            out.push(b'"');
        }
        out.extend_from_slice(b"}}");
        Ok(out)
    }
}

/// Input to one reseal invocation
#[derive(Debug)]
pub struct ResealRequest<'a> {
    pub secret: &'a PlaintextSecret,
    pub key: &'a PublicKeyMaterial,
    pub scope: SealingScope,
    pub scratch: &'a ScratchSlot,
}

/// Resealing failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResealError {
    #[error("resealing tool unavailable: {0}")]
    Unavailable(String),
    #[error("resealing failed (exit code {exit_code:?}): {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("resealing timed out after {0:?}")]
    Timeout(Duration),
    /// The tool succeeded but its output is not a usable SealedSecret
    #[error("resealed output is invalid: {0}")]
    Representation(String),
    #[error("resealing I/O error: {0}")]
    Io(String),
}

/// The resealing primitive
#[async_trait]
pub trait Resealer: Send + Sync {
    /// Encrypt `request.secret` with `request.key`, returning the new `encryptedData`
    async fn reseal(
        &self,
        request: ResealRequest<'_>,
    ) -> Result<BTreeMap<String, String>, ResealError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn plaintext() -> PlaintextSecret {
        PlaintextSecret::new(
            "payments",
            "db",
            Some("Opaque".to_string()),
            BTreeMap::from([
                ("password".to_string(), Zeroizing::new(b"hunter2".to_vec())),
                ("user".to_string(), Zeroizing::new(b"app".to_vec())),
            ]),
        )
    }

    #[test]
    fn test_debug_redacts_values() {
        let debug = format!("{:?}", plaintext());
        assert!(debug.contains("password"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_manifest_json_is_valid_secret() {
        let manifest = plaintext().to_manifest_json().expect("manifest");
        let value: serde_json::Value = serde_json::from_slice(&manifest).expect("valid json");
        assert_eq!(value["kind"], "Secret");
        assert_eq!(value["metadata"]["name"], "db");
        assert_eq!(value["metadata"]["namespace"], "payments");
        assert_eq!(value["type"], "Opaque");
        assert_eq!(value["data"]["password"], STANDARD.encode("hunter2"));
        assert_eq!(value["data"]["user"], STANDARD.encode("app"));
    }

    #[test]
    fn test_manifest_json_escapes_names() {
        let secret = PlaintextSecret::new(
            "payments",
            "db",
            None,
            BTreeMap::from([("we\"ird".to_string(), Zeroizing::new(b"x".to_vec()))]),
        );
        let manifest = secret.to_manifest_json().expect("manifest");
        let value: serde_json::Value = serde_json::from_slice(&manifest).expect("valid json");
        assert_eq!(value["data"]["we\"ird"], STANDARD.encode("x"));
        assert!(value.get("type").is_none());
    }

    #[test]
    fn test_from_secret_copies_data() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "token".to_string(),
                ByteString(b"s3cr3t".to_vec()),
            )])),
            type_: Some("Opaque".to_string()),
            ..Secret::default()
        };
        let plaintext = PlaintextSecret::from_secret(&secret, "payments", "api");
        assert_eq!(plaintext.keys(), vec!["token"]);
        assert_eq!(plaintext.type_.as_deref(), Some("Opaque"));
        assert!(!plaintext.is_empty());
    }
}

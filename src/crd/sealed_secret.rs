//! # SealedSecret
//!
//! The SealedSecret custom resource and the helpers the engine uses to read
//! its spec and build the resealed replacement object.

use crate::cluster::SealedSecretRef;
use crate::constants::{
    CLUSTER_WIDE_ANNOTATION, KEY_FINGERPRINT_ANNOTATION, NAMESPACE_WIDE_ANNOTATION,
    REENCRYPTED_AT_ANNOTATION,
};
use crate::controller::fingerprint::CiphertextFingerprint;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// SealedSecret Custom Resource
///
/// # Example
///
/// ```yaml
/// apiVersion: bitnami.com/v1alpha1
/// kind: SealedSecret
/// metadata:
///   name: database-credentials
///   namespace: payments
/// spec:
///   encryptedData:
///     password: AgBy8hCi...
///   template:
///     metadata:
///       name: database-credentials
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "SealedSecret",
    group = "bitnami.com",
    version = "v1alpha1",
    namespaced,
    status = "SealedSecretStatus",
    shortname = "sealed"
)]
#[serde(rename_all = "camelCase")]
pub struct SealedSecretSpec {
    /// Ciphertext per Secret key, produced by the controller's public key
    #[serde(default)]
    pub encrypted_data: BTreeMap<String, String>,
    /// Template for the Secret the controller materializes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<SecretTemplateSpec>,
}

/// Template of the decrypted Secret
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SecretTemplateMetadata>,
    /// Secret type (e.g. `Opaque`, `kubernetes.io/tls`)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immutable: Option<bool>,
    /// Plaintext template data (not secret)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

/// Subset of ObjectMeta allowed in a SealedSecret template
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplateMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Status written by the sealed-secrets controller
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SealedSecretStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SealedSecretCondition>,
}

/// Condition reported by the sealed-secrets controller (type `Synced`)
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SealedSecretCondition {
    pub r#type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Sealing scope selected by the well-known sealed-secrets annotations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SealingScope {
    /// Bound to both name and namespace (default)
    Strict,
    /// Bound to the namespace only
    NamespaceWide,
    /// Not bound to name or namespace
    ClusterWide,
}

impl SealingScope {
    /// Value accepted by `kubeseal --scope`
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SealingScope::Strict => "strict",
            SealingScope::NamespaceWide => "namespace-wide",
            SealingScope::ClusterWide => "cluster-wide",
        }
    }
}

/// What the engine needs from a SealedSecret spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecretSpecSummary {
    pub encrypted_data_fingerprint: CiphertextFingerprint,
    /// Name of the Secret the controller materializes
    pub template_target_name: String,
}

impl SealedSecret {
    /// Identity and resourceVersion of this object
    ///
    /// Returns `None` for objects without name or namespace, which the API
    /// server never returns for a namespaced list.
    pub fn reference(&self) -> Option<SealedSecretRef> {
        let name = self.metadata.name.clone()?;
        let namespace = self.metadata.namespace.clone()?;
        Some(SealedSecretRef::new(
            namespace,
            name,
            self.metadata.resource_version.clone(),
        ))
    }

    /// Fingerprint of the current ciphertext and the expected Secret name
    pub fn spec_summary(&self) -> SealedSecretSpecSummary {
        SealedSecretSpecSummary {
            encrypted_data_fingerprint: CiphertextFingerprint::of(&self.spec.encrypted_data),
            template_target_name: self.template_target_name(),
        }
    }

    /// Name of the decrypted Secret; the controller defaults it to the SealedSecret's name
    pub fn template_target_name(&self) -> String {
        self.spec
            .template
            .as_ref()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| self.metadata.name.clone())
            .unwrap_or_default()
    }

    /// Sealing scope from the object or template annotations
    pub fn sealing_scope(&self) -> SealingScope {
        let template_annotations = self
            .spec
            .template
            .as_ref()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref());
        let is_set = |key: &str| {
            self.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(key))
                .or_else(|| template_annotations.and_then(|a| a.get(key)))
                .is_some_and(|v| v == "true")
        };

        if is_set(CLUSTER_WIDE_ANNOTATION) {
            SealingScope::ClusterWide
        } else if is_set(NAMESPACE_WIDE_ANNOTATION) {
            SealingScope::NamespaceWide
        } else {
            SealingScope::Strict
        }
    }

    /// Fingerprint of the certificate this object was last resealed with, if recorded
    pub fn key_fingerprint_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(KEY_FINGERPRINT_ANNOTATION))
            .map(String::as_str)
    }

    /// Message of the controller's `Synced` condition, if any
    pub fn synced_condition_message(&self) -> Option<&str> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.r#type == "Synced")
            .and_then(|c| c.message.as_deref())
    }

    /// Build the replacement object carrying the new ciphertext
    ///
    /// Metadata (including `resourceVersion`) is kept so the update is
    /// rejected if the object changed since it was read.
    #[must_use]
    pub fn with_resealed_data(
        &self,
        encrypted_data: BTreeMap<String, String>,
        key_fingerprint: &str,
        resealed_at: DateTime<Utc>,
    ) -> SealedSecret {
        let mut updated = self.clone();
        updated.spec.encrypted_data = encrypted_data;
        updated.metadata.managed_fields = None;
        let annotations = updated.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(
            KEY_FINGERPRINT_ANNOTATION.to_string(),
            key_fingerprint.to_string(),
        );
        annotations.insert(
            REENCRYPTED_AT_ANNOTATION.to_string(),
            resealed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        updated
    }
}

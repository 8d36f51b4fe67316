//! # Custom Resource Definitions
//!
//! Types for the `bitnami.com/v1alpha1` `SealedSecret` resource managed by the
//! sealed-secrets controller. The CRD itself is installed by that controller;
//! these types only mirror the fields re-encryption reads and writes.

mod sealed_secret;

pub use sealed_secret::{
    SealedSecret, SealedSecretCondition, SealedSecretSpec, SealedSecretSpecSummary,
    SealedSecretStatus, SealingScope, SecretTemplateMetadata, SecretTemplateSpec,
};

//! # Structural Validation
//!
//! Local checks run before the server-side dry-run. Names follow RFC 1123.

use crate::crd::SealedSecret;
use regex::Regex;
use std::sync::LazyLock;

static SUBDOMAIN_REGEX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").ok()
});

static LABEL_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").ok());

/// Validate a resource name (RFC 1123 subdomain)
/// Length: 1-253 characters, lowercase alphanumeric, hyphens, dots
pub fn validate_resource_name(name: &str, field_name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{field_name} cannot be empty"));
    }
    if name.len() > 253 {
        return Err(format!(
            "{field_name} '{name}' exceeds maximum length of 253 characters (got {})",
            name.len()
        ));
    }
    let regex = SUBDOMAIN_REGEX
        .as_ref()
        .ok_or_else(|| "Failed to compile name regex".to_string())?;
    if !regex.is_match(name) {
        return Err(format!(
            "{field_name} '{name}' must be a valid Kubernetes name (lowercase alphanumeric, hyphens, dots; cannot start/end with hyphen or dot)"
        ));
    }
    Ok(())
}

/// Validate a namespace (RFC 1123 label)
/// Length: 1-63 characters, lowercase alphanumeric, hyphens
pub fn validate_namespace(namespace: &str) -> Result<(), String> {
    if namespace.is_empty() {
        return Err("metadata.namespace cannot be empty".to_string());
    }
    if namespace.len() > 63 {
        return Err(format!(
            "metadata.namespace '{namespace}' exceeds maximum length of 63 characters (got {})",
            namespace.len()
        ));
    }
    let regex = LABEL_REGEX
        .as_ref()
        .ok_or_else(|| "Failed to compile namespace regex".to_string())?;
    if !regex.is_match(namespace) {
        return Err(format!(
            "metadata.namespace '{namespace}' must be a valid Kubernetes namespace (lowercase alphanumeric, hyphens; cannot start/end with hyphen)"
        ));
    }
    Ok(())
}

/// Structural checks on a fetched SealedSecret
pub fn validate_sealed_secret(object: &SealedSecret) -> Result<(), String> {
    validate_resource_name(
        object.metadata.name.as_deref().unwrap_or_default(),
        "metadata.name",
    )?;
    validate_namespace(object.metadata.namespace.as_deref().unwrap_or_default())?;
    let target = object.template_target_name();
    validate_resource_name(&target, "spec.template.metadata.name")?;

    if object.spec.encrypted_data.is_empty() {
        return Err("spec.encryptedData is empty".to_string());
    }
    if let Some(key) = object
        .spec
        .encrypted_data
        .iter()
        .find_map(|(k, v)| v.trim().is_empty().then_some(k))
    {
        return Err(format!("spec.encryptedData.{key} is empty"));
    }
    Ok(())
}

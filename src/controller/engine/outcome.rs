//! Terminal result of one item

use super::state::{ErrorKind, ItemState, ReencryptionItem, SkipReason};
use crate::cluster::SealedSecretRef;
use crate::controller::fingerprint::CiphertextFingerprint;
use serde::Serialize;
use std::path::PathBuf;

/// What happened to one SealedSecret during a run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub reference: SealedSecretRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_secret_name: Option<String>,
    pub final_state: ItemState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_fingerprint: Option<CiphertextFingerprint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_fingerprint: Option<CiphertextFingerprint>,
    pub states_visited: Vec<ItemState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_path: Option<PathBuf>,
    pub duration_ms: u64,
    /// Whether the guarded update was submitted to the API server
    pub write_attempted: bool,
}

impl ItemOutcome {
    /// Snapshot a terminal item
    pub fn from_item(item: &ReencryptionItem) -> Self {
        Self {
            reference: item.reference.clone(),
            expected_secret_name: item.expected_secret_name.clone(),
            final_state: item.state(),
            attempts: item.attempts,
            last_error: item.last_error.clone(),
            detail: None,
            old_fingerprint: None,
            new_fingerprint: None,
            states_visited: item.visited().to_vec(),
            audit_path: None,
            duration_ms: 0,
            write_attempted: false,
        }
    }

    /// An item the scheduler never dispatched
    pub fn not_started(reference: SealedSecretRef) -> Self {
        Self {
            reference,
            expected_secret_name: None,
            final_state: ItemState::Skipped(SkipReason::Cancelled),
            attempts: 0,
            last_error: None,
            detail: Some("run cancelled before the item started".to_string()),
            old_fingerprint: None,
            new_fingerprint: None,
            states_visited: vec![ItemState::Skipped(SkipReason::Cancelled)],
            audit_path: None,
            duration_ms: 0,
            write_attempted: false,
        }
    }

    /// An item whose engine panicked
    pub fn panicked(reference: SealedSecretRef, attempts: u32, message: String) -> Self {
        Self {
            reference,
            expected_secret_name: None,
            final_state: ItemState::Failed(ErrorKind::Internal),
            attempts,
            last_error: Some(format!("engine panicked: {message}")),
            detail: None,
            old_fingerprint: None,
            new_fingerprint: None,
            states_visited: vec![ItemState::Discovered, ItemState::Failed(ErrorKind::Internal)],
            audit_path: None,
            duration_ms: 0,
            write_attempted: false,
        }
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.final_state {
            ItemState::Failed(kind) => Some(kind),
            _ => None,
        }
    }

    #[must_use]
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.final_state {
            ItemState::Skipped(reason) => Some(reason),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.final_state == ItemState::Committed
    }

    #[must_use]
    pub fn reached(&self, state: ItemState) -> bool {
        self.states_visited.contains(&state)
    }

    /// Whether the scheduler should run another pass for this item
    #[must_use]
    pub fn should_retry(&self, max_attempts: u32) -> bool {
        !self.write_attempted
            && self.attempts < max_attempts
            && self.error_kind().is_some_and(|k| k.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> SealedSecretRef {
        SealedSecretRef::new("payments", "db", None)
    }

    #[test]
    fn test_not_started_is_cancelled_skip() {
        let outcome = ItemOutcome::not_started(reference());
        assert_eq!(outcome.skip_reason(), Some(SkipReason::Cancelled));
        assert_eq!(outcome.attempts, 0);
        assert!(!outcome.is_committed());
    }

    #[test]
    fn test_panicked_is_internal_failure() {
        let outcome = ItemOutcome::panicked(reference(), 1, "boom".to_string());
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Internal));
        assert_eq!(outcome.last_error.as_deref(), Some("engine panicked: boom"));
    }

    #[test]
    fn test_should_retry_only_pre_write_conflicts() {
        let mut item = ReencryptionItem::new(reference());
        item.fail(ErrorKind::ConcurrentModification, "changed")
            .expect("fail");
        let mut outcome = ItemOutcome::from_item(&item);

        assert!(!outcome.should_retry(1));
        assert!(outcome.should_retry(2));

        outcome.write_attempted = true;
        assert!(!outcome.should_retry(2));

        let mut item = ReencryptionItem::new(reference());
        item.fail(ErrorKind::ValidationError, "bad").expect("fail");
        assert!(!ItemOutcome::from_item(&item).should_retry(5));
    }

    #[test]
    fn test_serializes_state_labels() {
        let outcome = ItemOutcome::not_started(reference());
        let json = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(json["finalState"], "Skipped(Cancelled)");
        assert_eq!(json["reference"]["namespace"], "payments");
        assert!(json.get("auditPath").is_none());
    }
}

//! # Item State Machine
//!
//! States, error kinds and skip reasons of a single re-encryption item.
//!
//! ```text
//! Discovered → Validated → AwaitingDecryption → Resealed → Verified → Committed
//!      └──────────┴──────────────┴──────────────┴──────────┴──→ Failed(kind) | Skipped(reason)
//! ```

use crate::cluster::SealedSecretRef;
use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Why an item failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// API server unreachable after retries; aborts the run
    ClusterUnreachable,
    /// Local validation or server-side dry-run rejected the object
    ValidationError,
    /// Resealed output could not be parsed into `encryptedData`
    RepresentationInvalid,
    /// kubeseal failed or timed out
    ResealFailed,
    /// New ciphertext is identical to the old ciphertext
    NoChangeDetected,
    /// Object changed after it was read
    ConcurrentModification,
    /// Audit copy could not be written or the update was refused
    WriteConflict,
    /// Run cancelled while the item was in flight
    Cancelled,
    /// The engine panicked or attempted an invalid transition
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClusterUnreachable => "ClusterUnreachable",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::RepresentationInvalid => "RepresentationInvalid",
            ErrorKind::ResealFailed => "ResealFailed",
            ErrorKind::NoChangeDetected => "NoChangeDetected",
            ErrorKind::ConcurrentModification => "ConcurrentModification",
            ErrorKind::WriteConflict => "WriteConflict",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Whether a fresh pass from `Discovered` may succeed
    ///
    /// Only conflicts detected before the write are retried; the scheduler
    /// additionally checks that no write was attempted.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ConcurrentModification)
    }

    /// Whether this failure aborts the whole run
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::ClusterUnreachable)
    }

    /// Operator guidance for this failure
    #[must_use]
    pub fn remediation(&self) -> &'static str {
        match self {
            ErrorKind::ClusterUnreachable => {
                "Check API server connectivity and the kubeconfig context, then re-run"
            }
            ErrorKind::ValidationError => {
                "Inspect the SealedSecret manifest and admission webhooks; fix the object and re-run"
            }
            ErrorKind::RepresentationInvalid => {
                "Check the kubeseal version; its output could not be parsed as a SealedSecret"
            }
            ErrorKind::ResealFailed => {
                "Check that kubeseal is installed and that the controller certificate is valid"
            }
            ErrorKind::NoChangeDetected => {
                "The ciphertext did not change; verify the controller key was actually rotated"
            }
            ErrorKind::ConcurrentModification => {
                "The object was modified during the run; re-run to reseal the latest version"
            }
            ErrorKind::WriteConflict => {
                "Check output directory permissions and RBAC for updating sealedsecrets"
            }
            ErrorKind::Cancelled => "The run was cancelled; re-run to process this item",
            ErrorKind::Internal => "Internal error; re-run with RUST_LOG=debug and report the log",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an item was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The controller has not materialized the decrypted Secret
    NoDecryptedSecret,
    /// Already sealed with the current key (and `--force` not set)
    KeyUnchanged,
    /// Dry-run mode; nothing was submitted
    DryRun,
    /// The SealedSecret was deleted after it was listed
    Deleted,
    /// Never started because the run was cancelled or aborted
    Cancelled,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoDecryptedSecret => "NoDecryptedSecret",
            SkipReason::KeyUnchanged => "KeyUnchanged",
            SkipReason::DryRun => "DryRun",
            SkipReason::Deleted => "Deleted",
            SkipReason::Cancelled => "Cancelled",
        }
    }

    /// Skips that still allow a successful exit code
    #[must_use]
    pub fn is_expected(&self) -> bool {
        !matches!(self, SkipReason::Cancelled)
    }
}

/// State of a re-encryption item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    Discovered,
    Validated,
    AwaitingDecryption,
    Resealed,
    Verified,
    Committed,
    Failed(ErrorKind),
    Skipped(SkipReason),
}

impl ItemState {
    /// Position in the forward pipeline; terminal failure states have none
    fn rank(&self) -> Option<u8> {
        match self {
            ItemState::Discovered => Some(0),
            ItemState::Validated => Some(1),
            ItemState::AwaitingDecryption => Some(2),
            ItemState::Resealed => Some(3),
            ItemState::Verified => Some(4),
            ItemState::Committed => Some(5),
            ItemState::Failed(_) | ItemState::Skipped(_) => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Committed | ItemState::Failed(_) | ItemState::Skipped(_)
        )
    }

    /// Forward along the pipeline, or to `Failed`/`Skipped`, from a non-terminal state
    #[must_use]
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(current), Some(next)) => next > current,
            (None, Some(_)) => false,
        }
    }

    /// Stable label used in counts and reports, e.g. `Failed(NoChangeDetected)`
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            ItemState::Discovered => "Discovered".to_string(),
            ItemState::Validated => "Validated".to_string(),
            ItemState::AwaitingDecryption => "AwaitingDecryption".to_string(),
            ItemState::Resealed => "Resealed".to_string(),
            ItemState::Verified => "Verified".to_string(),
            ItemState::Committed => "Committed".to_string(),
            ItemState::Failed(kind) => format!("Failed({})", kind.as_str()),
            ItemState::Skipped(reason) => format!("Skipped({})", reason.as_str()),
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for ItemState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// A transition the state machine does not allow
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ItemState,
    pub to: ItemState,
}

/// One SealedSecret moving through the pipeline
///
/// Owned by exactly one engine instance. A retry is a new item with
/// `attempts + 1`, so states never move backwards.
#[derive(Debug, Clone)]
pub struct ReencryptionItem {
    pub reference: SealedSecretRef,
    pub expected_secret_name: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    state: ItemState,
    visited: Vec<ItemState>,
}

impl ReencryptionItem {
    pub fn new(reference: SealedSecretRef) -> Self {
        Self {
            reference,
            expected_secret_name: None,
            attempts: 1,
            last_error: None,
            state: ItemState::Discovered,
            visited: vec![ItemState::Discovered],
        }
    }

    #[must_use]
    pub fn state(&self) -> ItemState {
        self.state
    }

    /// States in the order they were entered, starting with `Discovered`
    #[must_use]
    pub fn visited(&self) -> &[ItemState] {
        &self.visited
    }

    /// Whether the item ever entered `state`
    #[must_use]
    pub fn reached(&self, state: ItemState) -> bool {
        self.visited.contains(&state)
    }

    /// Move to `next`, rejecting backward moves and moves out of a terminal state
    pub fn transition(&mut self, next: ItemState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.visited.push(next);
        Ok(())
    }

    /// Move to `Failed(kind)` and record the error message
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> Result<(), InvalidTransition> {
        self.last_error = Some(message.into());
        self.transition(ItemState::Failed(kind))
    }

    /// A fresh item for the next pipeline pass
    ///
    /// The resourceVersion is dropped so the next pass captures the current one.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            reference: self.reference.at_version(None),
            expected_secret_name: None,
            attempts: self.attempts + 1,
            last_error: None,
            state: ItemState::Discovered,
            visited: vec![ItemState::Discovered],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> ReencryptionItem {
        ReencryptionItem::new(SealedSecretRef::new("payments", "db", Some("1".to_string())))
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut item = item();
        for next in [
            ItemState::Validated,
            ItemState::AwaitingDecryption,
            ItemState::Resealed,
            ItemState::Verified,
            ItemState::Committed,
        ] {
            item.transition(next).expect("forward transition");
        }
        assert_eq!(item.state(), ItemState::Committed);
        assert_eq!(item.visited().len(), 6);
        assert!(item.reached(ItemState::Resealed));
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut item = item();
        item.transition(ItemState::Validated).expect("forward");
        item.transition(ItemState::AwaitingDecryption).expect("forward");
        let err = item.transition(ItemState::Validated).unwrap_err();
        assert_eq!(err.from, ItemState::AwaitingDecryption);
        assert_eq!(err.to, ItemState::Validated);
        assert_eq!(item.state(), ItemState::AwaitingDecryption);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut item = item();
        item.fail(ErrorKind::ValidationError, "admission denied")
            .expect("fail from Discovered");
        assert!(item.state().is_terminal());
        assert!(item.transition(ItemState::Validated).is_err());
        assert!(item
            .transition(ItemState::Skipped(SkipReason::DryRun))
            .is_err());
        assert_eq!(item.last_error.as_deref(), Some("admission denied"));
    }

    #[test]
    fn test_terminal_reachable_from_any_non_terminal_state() {
        for state in [
            ItemState::Discovered,
            ItemState::Validated,
            ItemState::AwaitingDecryption,
            ItemState::Resealed,
            ItemState::Verified,
        ] {
            assert!(state.can_transition_to(ItemState::Failed(ErrorKind::Internal)));
            assert!(state.can_transition_to(ItemState::Skipped(SkipReason::Cancelled)));
        }
        assert!(!ItemState::Committed.can_transition_to(ItemState::Failed(ErrorKind::Internal)));
    }

    #[test]
    fn test_next_attempt_starts_over() {
        let mut item = item();
        item.transition(ItemState::Validated).expect("forward");
        item.fail(ErrorKind::ConcurrentModification, "resourceVersion changed")
            .expect("fail");

        let retry = item.next_attempt();
        assert_eq!(retry.attempts, 2);
        assert_eq!(retry.state(), ItemState::Discovered);
        assert!(retry.reference.resource_version.is_none());
        assert!(retry.last_error.is_none());
    }

    #[test]
    fn test_labels() {
        assert_eq!(ItemState::Committed.label(), "Committed");
        assert_eq!(
            ItemState::Failed(ErrorKind::NoChangeDetected).label(),
            "Failed(NoChangeDetected)"
        );
        assert_eq!(
            ItemState::Skipped(SkipReason::NoDecryptedSecret).to_string(),
            "Skipped(NoDecryptedSecret)"
        );
        assert_eq!(
            serde_json::to_string(&ItemState::Skipped(SkipReason::DryRun)).expect("serialize"),
            "\"Skipped(DryRun)\""
        );
    }

    #[test]
    fn test_error_kind_classification() {
        assert!(ErrorKind::ClusterUnreachable.is_fatal());
        assert!(!ErrorKind::ValidationError.is_fatal());
        assert!(ErrorKind::ConcurrentModification.is_retryable());
        assert!(!ErrorKind::NoChangeDetected.is_retryable());
        assert!(!ErrorKind::WriteConflict.remediation().is_empty());
        assert!(SkipReason::NoDecryptedSecret.is_expected());
        assert!(!SkipReason::Cancelled.is_expected());
    }
}

//! # Scratch Arena
//!
//! Run-scoped temporary storage for resealing. Each engine pass gets its own
//! slot keyed by (namespace, name, attempt); the slot is removed when dropped
//! and the whole arena is removed when the run ends.
//!
//! Only public material (the controller certificate) is written here.
//! Plaintext is piped to kubeseal over stdin and never touches disk.

use crate::cluster::SealedSecretRef;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Root directory shared by all slots of one run
#[derive(Debug)]
pub struct ScratchArena {
    root: TempDir,
}

impl ScratchArena {
    /// Create a new arena under the system temp directory
    pub fn new() -> std::io::Result<Self> {
        let root = tempfile::Builder::new().prefix("ssrctl-").tempdir()?;
        debug!(path = %root.path().display(), "Created scratch arena");
        Ok(Self { root })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Allocate the slot for one pipeline pass
    pub fn slot(&self, reference: &SealedSecretRef, attempt: u32) -> std::io::Result<ScratchSlot> {
        let path = self
            .root
            .path()
            .join(&reference.namespace)
            .join(&reference.name)
            .join(format!("attempt-{attempt}"));
        std::fs::create_dir_all(&path)?;
        Ok(ScratchSlot { path })
    }
}

/// A directory owned by one engine pass, removed on drop
#[derive(Debug)]
pub struct ScratchSlot {
    path: PathBuf,
}

impl ScratchSlot {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchSlot {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "Failed to remove scratch slot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(name: &str) -> SealedSecretRef {
        SealedSecretRef::new("payments", name, None)
    }

    #[test]
    fn test_slot_layout() {
        let arena = ScratchArena::new().expect("arena");
        let slot = arena.slot(&reference("db"), 2).expect("slot");
        assert_eq!(
            slot.path(),
            arena.path().join("payments").join("db").join("attempt-2")
        );
        assert!(slot.path().is_dir());
    }

    #[test]
    fn test_slot_removed_on_drop() {
        let arena = ScratchArena::new().expect("arena");
        let path = {
            let slot = arena.slot(&reference("db"), 1).expect("slot");
            std::fs::write(slot.path().join("cert.pem"), b"public").expect("write");
            slot.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_slots_are_independent() {
        let arena = ScratchArena::new().expect("arena");
        let first = arena.slot(&reference("db"), 1).expect("slot");
        let second = arena.slot(&reference("db"), 2).expect("slot");
        let other = arena.slot(&reference("api"), 1).expect("slot");

        drop(first);
        assert!(second.path().is_dir());
        assert!(other.path().is_dir());
    }

    #[test]
    fn test_arena_removed_on_drop() {
        let arena = ScratchArena::new().expect("arena");
        let root = arena.path().to_path_buf();
        let slot = arena.slot(&reference("db"), 1).expect("slot");
        drop(slot);
        drop(arena);
        assert!(!root.exists());
    }
}

//! Local store contract.

use crate::change::SyncChange;
use crate::error::{EngineResult, SyncError};
use parking_lot::RwLock;

/// The local side of synchronization.
///
/// The engine reads queued changes, applies pulled changes and
/// acknowledges pushed changes once a pass has fully completed.
pub trait LocalStore: Send + Sync {
    /// Returns changes queued for push.
    fn pending_changes(&self) -> EngineResult<Vec<SyncChange>>;

    /// Applies remote changes that won over local state.
    fn apply_remote_changes(&self, changes: &[SyncChange]) -> EngineResult<()>;

    /// Drops pushed changes from the queue.
    fn acknowledge(&self, pushed: &[SyncChange]) -> EngineResult<()>;
}

/// An in-memory local store for testing.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    pending: RwLock<Vec<SyncChange>>,
    applied: RwLock<Vec<SyncChange>>,
    fail_apply: RwLock<Option<String>>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a local change.
    pub fn enqueue(&self, change: SyncChange) {
        self.pending.write().push(change);
    }

    /// Returns every change applied from the remote.
    pub fn applied(&self) -> Vec<SyncChange> {
        self.applied.read().clone()
    }

    /// Returns the number of queued changes.
    pub fn pending_len(&self) -> usize {
        self.pending.read().len()
    }

    /// Makes `apply_remote_changes` fail with `message` until cleared.
    pub fn fail_apply(&self, message: Option<String>) {
        *self.fail_apply.write() = message;
    }
}

impl LocalStore for MemoryLocalStore {
    fn pending_changes(&self) -> EngineResult<Vec<SyncChange>> {
        Ok(self.pending.read().clone())
    }

    fn apply_remote_changes(&self, changes: &[SyncChange]) -> EngineResult<()> {
        if let Some(message) = self.fail_apply.read().clone() {
            return Err(SyncError::Local(message));
        }
        self.applied.write().extend(changes.iter().cloned());
        Ok(())
    }

    fn acknowledge(&self, pushed: &[SyncChange]) -> EngineResult<()> {
        self.pending
            .write()
            .retain(|queued| !pushed.contains(queued));
        Ok(())
    }
}

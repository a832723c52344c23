//! Engine state, statistics and per-pass results.

use crate::change::SyncChange;
use crate::value::Timestamp;
use serde::{Deserialize, Serialize};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is ensuring the zone and subscriptions exist.
    SettingUp,
    /// Engine is pushing and pulling concurrently.
    Exchanging,
    /// Engine is resolving conflicts and applying pulled changes.
    Resolving,
    /// Engine has completed a sync pass.
    Synced,
    /// The last pass failed.
    Error,
}

impl SyncState {
    /// Returns true if a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::SettingUp | SyncState::Exchanging | SyncState::Resolving
        )
    }
}

/// Cumulative statistics across passes.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Passes that completed successfully.
    pub cycles_completed: u64,
    /// Passes that ended in an error other than cancellation.
    pub cycles_failed: u64,
    /// Changes pushed, counting conflict re-pushes.
    pub changes_pushed: u64,
    /// Changes pulled.
    pub changes_pulled: u64,
    /// Conflicts resolved.
    pub conflicts_resolved: u64,
    /// Watermark written by the last successful pass.
    pub last_sync: Option<Timestamp>,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Local changes pushed.
    pub pushed_count: usize,
    /// Remote changes pulled.
    pub pulled_count: usize,
    /// Conflicts resolved.
    pub conflicts_resolved: usize,
    /// The new watermark.
    pub timestamp: Timestamp,
}

/// Everything one pull returned.
#[derive(Debug, Clone, PartialEq)]
pub struct PulledChanges {
    /// Remote changes, most recently changed first.
    pub changes: Vec<SyncChange>,
    /// Server change time of the first page. Remote changes made after
    /// the pull began carry a later change time.
    pub server_time: Timestamp,
}

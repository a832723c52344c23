//! Conflict detection and resolution.
//!
//! A conflict exists when the same record was changed on both sides since
//! the last watermark and the remote side is not the echo of the local
//! write.
//! Detection is pure; resolution is delegated to a [`ConflictResolver`]
//! so the policy can be swapped without touching the engine.

use crate::change::SyncChange;
use crate::error::{EngineResult, SyncError};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A record changed both locally and remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConflict {
    /// The record both changes refer to.
    pub record_id: String,
    /// The local side.
    pub local_change: SyncChange,
    /// The remote side.
    pub remote_change: SyncChange,
}

impl SyncConflict {
    /// Creates a conflict keyed by the local change's record id.
    pub fn new(local_change: SyncChange, remote_change: SyncChange) -> Self {
        Self {
            record_id: local_change.record_id().to_string(),
            local_change,
            remote_change,
        }
    }

    /// Returns true if exactly one side deletes the record.
    pub fn is_update_delete_conflict(&self) -> bool {
        self.local_change.is_delete() != self.remote_change.is_delete()
    }
}

/// What to do with a conflicted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionStrategy {
    /// Keep the local change and overwrite the remote.
    UseLocal,
    /// Keep the remote value.
    UseRemote,
    /// Push a resolver-supplied merged change.
    Merge,
}

/// The decision for one conflict.
///
/// A merged change is present exactly when the strategy is
/// [`ResolutionStrategy::Merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    strategy: ResolutionStrategy,
    local_change: SyncChange,
    merged_change: Option<SyncChange>,
}

impl ConflictResolution {
    /// Keep the local change.
    pub fn use_local(local_change: SyncChange) -> Self {
        Self {
            strategy: ResolutionStrategy::UseLocal,
            local_change,
            merged_change: None,
        }
    }

    /// Keep the remote value.
    pub fn use_remote(local_change: SyncChange) -> Self {
        Self {
            strategy: ResolutionStrategy::UseRemote,
            local_change,
            merged_change: None,
        }
    }

    /// Replace both sides with `merged_change`.
    pub fn merge(local_change: SyncChange, merged_change: SyncChange) -> Self {
        Self {
            strategy: ResolutionStrategy::Merge,
            local_change,
            merged_change: Some(merged_change),
        }
    }

    /// Builds the resolution for `conflict` under `strategy`.
    ///
    /// `Merge` is not accepted here because it needs a merged change.
    pub fn for_conflict(conflict: &SyncConflict, strategy: ResolutionStrategy) -> Option<Self> {
        match strategy {
            ResolutionStrategy::UseLocal => Some(Self::use_local(conflict.local_change.clone())),
            ResolutionStrategy::UseRemote => Some(Self::use_remote(conflict.local_change.clone())),
            ResolutionStrategy::Merge => None,
        }
    }

    /// Returns the strategy.
    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    /// Returns the local change this resolution answers.
    pub fn local_change(&self) -> &SyncChange {
        &self.local_change
    }

    /// Returns the merged change for `Merge` resolutions.
    pub fn merged_change(&self) -> Option<&SyncChange> {
        self.merged_change.as_ref()
    }

    /// Returns the record this resolution refers to.
    pub fn record_id(&self) -> &str {
        self.local_change.record_id()
    }

    /// Returns the change that must be pushed to the remote, if any.
    pub fn change_to_push(&self) -> Option<&SyncChange> {
        match self.strategy {
            ResolutionStrategy::UseLocal => Some(&self.local_change),
            ResolutionStrategy::UseRemote => None,
            ResolutionStrategy::Merge => self.merged_change.as_ref(),
        }
    }
}

/// Finds records changed on both sides.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Creates a detector.
    pub fn new() -> Self {
        Self
    }

    /// Returns one conflict per record id present in both sets, ordered by
    /// record id. A remote change that [includes](SyncChange::includes) the
    /// local one is an echo, not a conflict.
    ///
    /// When a side holds several changes for one record only the latest
    /// is compared.
    pub fn detect(&self, local: &[SyncChange], remote: &[SyncChange]) -> Vec<SyncConflict> {
        let local = latest_by_record(local);
        let remote = latest_by_record(remote);

        local
            .into_iter()
            .filter_map(|(record_id, local_change)| {
                let remote_change = remote.get(record_id)?;
                (!remote_change.includes(local_change))
                    .then(|| SyncConflict::new(local_change.clone(), (*remote_change).clone()))
            })
            .collect()
    }
}

fn latest_by_record(changes: &[SyncChange]) -> BTreeMap<&str, &SyncChange> {
    let mut latest: BTreeMap<&str, &SyncChange> = BTreeMap::new();
    for change in changes {
        latest
            .entry(change.record_id())
            .and_modify(|current| {
                if change.timestamp() >= current.timestamp() {
                    *current = change;
                }
            })
            .or_insert(change);
    }
    latest
}

/// Decides how conflicts are settled.
///
/// Implementations must return exactly one resolution per conflict. The
/// engine checks this and fails the pass otherwise.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Resolves a batch of conflicts.
    async fn resolve(&self, conflicts: &[SyncConflict]) -> EngineResult<Vec<ConflictResolution>>;
}

/// Built-in automatic resolution policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Later timestamp wins; ties go to the remote.
    #[default]
    LastWriteWins,
    /// Local always wins.
    LocalWins,
    /// Remote always wins.
    RemoteWins,
}

impl ConflictPolicy {
    /// Chooses a strategy for one conflict.
    ///
    /// Deletes are compared by timestamp like any other change.
    pub fn decide(&self, conflict: &SyncConflict) -> ResolutionStrategy {
        match self {
            ConflictPolicy::LastWriteWins => {
                if conflict.local_change.timestamp() > conflict.remote_change.timestamp() {
                    ResolutionStrategy::UseLocal
                } else {
                    ResolutionStrategy::UseRemote
                }
            }
            ConflictPolicy::LocalWins => ResolutionStrategy::UseLocal,
            ConflictPolicy::RemoteWins => ResolutionStrategy::UseRemote,
        }
    }
}

#[async_trait]
impl ConflictResolver for ConflictPolicy {
    async fn resolve(&self, conflicts: &[SyncConflict]) -> EngineResult<Vec<ConflictResolution>> {
        conflicts
            .iter()
            .map(|conflict| {
                ConflictResolution::for_conflict(conflict, self.decide(conflict)).ok_or_else(|| {
                    SyncError::Resolver(format!("policy {self:?} produced a merge"))
                })
            })
            .collect()
    }
}

/// Checks that `resolutions` answer `conflicts` one-to-one.
pub(crate) fn validate_resolutions(
    conflicts: &[SyncConflict],
    resolutions: &[ConflictResolution],
) -> EngineResult<()> {
    if conflicts.len() != resolutions.len() {
        return Err(SyncError::IncompleteResolution {
            expected: conflicts.len(),
            actual: resolutions.len(),
        });
    }

    let mut expected: BTreeMap<&str, usize> = BTreeMap::new();
    for conflict in conflicts {
        *expected.entry(conflict.record_id.as_str()).or_default() += 1;
    }

    for resolution in resolutions {
        let record_id = resolution.record_id();
        match expected.get_mut(record_id) {
            Some(remaining) if *remaining > 0 => *remaining -= 1,
            _ => {
                return Err(SyncError::InvalidResolution {
                    record_id: record_id.to_string(),
                    reason: "no matching conflict".into(),
                })
            }
        }

        if let Some(merged) = resolution.merged_change() {
            if merged.record_id() != record_id {
                return Err(SyncError::InvalidResolution {
                    record_id: record_id.to_string(),
                    reason: format!("merged change targets {}", merged.record_id()),
                });
            }
        }
    }

    Ok(())
}

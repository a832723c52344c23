//! The sync engine.
//!
//! One pass of [`SyncEngine::sync_inventory`]:
//!
//! 1. Ensure the zone and subscriptions exist (first pass only)
//! 2. Read the watermark
//! 3. Push queued local changes and pull remote changes concurrently
//! 4. Detect and resolve conflicts, re-pushing winning local or merged changes
//! 5. Apply pulled changes locally
//! 6. Advance the watermark and acknowledge pushed changes
//!
//! The push is conditional: the remote refuses to overwrite a record it
//! changed after the watermark, and hands back its version instead. Those
//! records join the pulled changes for conflict detection, so a newer
//! remote write is never replaced without going through the resolver,
//! however the push and the pull interleave.
//!
//! The watermark is the remote's own change time at the start of the
//! pull, never a device clock. Nothing is committed unless every step
//! succeeds, so a failed or cancelled pass re-pulls a superset of changes
//! next time.

use crate::change::SyncChange;
use crate::config::SyncConfig;
use crate::conflict::{
    validate_resolutions, ConflictDetector, ConflictPolicy, ConflictResolution, ConflictResolver,
    ResolutionStrategy, SyncConflict,
};
use crate::error::{EngineResult, RemoteError, RemoteResult, SyncError};
use crate::local::LocalStore;
use crate::remote::{
    AccountStatus, ChangeSubscription, QueryCursor, QueryPage, RecordQuery, RemoteRecord,
    RemoteRecordStore, SaveCondition, SavePolicy,
};
use crate::state::{PulledChanges, SyncResult, SyncState, SyncStats};
use crate::value::Timestamp;
use crate::watermark::{MemoryWatermarkStore, WatermarkStore};
use cloudsync_net::{CancellationToken, CircuitBreaker, RetryConfig, RetryExecutor};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Synchronizes a [`LocalStore`] with a [`RemoteRecordStore`].
pub struct SyncEngine<S: RemoteRecordStore, L: LocalStore> {
    config: SyncConfig,
    remote: Arc<S>,
    local: Arc<L>,
    watermark: Arc<dyn WatermarkStore>,
    resolver: RwLock<Arc<dyn ConflictResolver>>,
    detector: ConflictDetector,
    breaker: Arc<CircuitBreaker>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    zone_ready: AtomicBool,
    in_flight: AtomicBool,
    current_pass: Mutex<CancellationToken>,
}

impl<S: RemoteRecordStore, L: LocalStore> SyncEngine<S, L> {
    /// Creates an engine with an in-memory watermark and the
    /// last-write-wins resolver.
    pub fn new(config: SyncConfig, remote: S, local: L) -> Self {
        Self::from_shared(config, Arc::new(remote), Arc::new(local))
    }

    /// Creates an engine over stores shared with other owners.
    pub fn from_shared(config: SyncConfig, remote: Arc<S>, local: Arc<L>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            format!("remote:{}", config.zone_name),
            config.breaker,
        ));
        let resolver: Arc<dyn ConflictResolver> = Arc::new(ConflictPolicy::default());
        Self {
            config,
            remote,
            local,
            watermark: Arc::new(MemoryWatermarkStore::new()),
            resolver: RwLock::new(resolver),
            detector: ConflictDetector::new(),
            breaker,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            zone_ready: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            current_pass: Mutex::new(CancellationToken::new()),
        }
    }

    /// Persists the watermark in `store`.
    pub fn with_watermark_store(mut self, store: impl WatermarkStore + 'static) -> Self {
        self.watermark = Arc::new(store);
        self
    }

    /// Uses `resolver` for conflicts.
    pub fn with_resolver(self, resolver: impl ConflictResolver + 'static) -> Self {
        *self.resolver.write() = Arc::new(resolver);
        self
    }

    /// Shares a circuit breaker with other clients of the same remote.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Replaces the resolver. Takes effect from the next resolution.
    pub fn set_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
        *self.resolver.write() = resolver;
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the remote store.
    pub fn remote(&self) -> &S {
        &self.remote
    }

    /// Returns the local store.
    pub fn local(&self) -> &L {
        &self.local
    }

    /// Returns the breaker guarding remote calls.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the cumulative stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the stored watermark. During a pass this is the pre-pass value.
    pub fn last_sync_date(&self) -> EngineResult<Option<Timestamp>> {
        self.watermark.load()
    }

    /// Cancels the running pass, if any.
    pub fn cancel(&self) {
        self.current_pass.lock().cancel();
    }

    /// Ensures the zone and one subscription per tracked record type exist.
    ///
    /// Existing zones and subscriptions count as success. An unusable
    /// account fails with [`SyncError::RemoteUnavailable`].
    pub async fn setup_zone(&self, cancel: &CancellationToken) -> EngineResult<()> {
        let retry = &self.config.setup_retry;
        let zone = self.config.zone_name.as_str();

        let status = match self
            .call_remote("account_status", retry, cancel, || self.remote.account_status())
            .await
        {
            Ok(status) => status,
            Err(SyncError::Remote(RemoteError::AccountUnavailable)) => {
                return Err(SyncError::RemoteUnavailable)
            }
            Err(e) => return Err(e),
        };
        if status == AccountStatus::Unavailable {
            warn!(zone, "remote account unavailable");
            return Err(SyncError::RemoteUnavailable);
        }

        match self
            .call_remote("create_zone", retry, cancel, || self.remote.create_zone(zone))
            .await
        {
            Ok(()) => info!(zone, "created zone"),
            Err(SyncError::Remote(RemoteError::ZoneAlreadyExists(_))) => {
                debug!(zone, "zone already exists")
            }
            Err(e) => return Err(e),
        }

        for record_type in &self.config.record_types {
            let subscription =
                ChangeSubscription::new(self.config.subscription_id(record_type), record_type.clone());
            match self
                .call_remote("create_subscription", retry, cancel, || {
                    self.remote.create_subscription(zone, &subscription)
                })
                .await
            {
                Ok(()) => info!(zone, id = %subscription.subscription_id, "created subscription"),
                Err(SyncError::Remote(RemoteError::SubscriptionAlreadyExists(_))) => {
                    debug!(zone, id = %subscription.subscription_id, "subscription already exists")
                }
                Err(e) => return Err(e),
            }
        }

        self.zone_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Runs one sync pass under an engine-owned token that [`cancel`](Self::cancel) trips.
    pub async fn sync_inventory(&self) -> EngineResult<SyncResult> {
        self.sync_inventory_with(&CancellationToken::new()).await
    }

    /// Runs one sync pass that also stops when `cancel` fires.
    ///
    /// Returns [`SyncError::SyncInProgress`] without side effects if a pass
    /// is already running on this engine.
    pub async fn sync_inventory_with(&self, cancel: &CancellationToken) -> EngineResult<SyncResult> {
        let Some(_flight) = FlightGuard::acquire(&self.in_flight) else {
            debug!("sync pass already running, rejecting overlap");
            return Err(SyncError::SyncInProgress);
        };

        let token = cancel.child_token();
        *self.current_pass.lock() = token.clone();

        let outcome = self.run_pass(&token).await;
        self.finish_pass(&outcome);
        outcome
    }

    /// Pushes `changes` in one batched save.
    ///
    /// Empty input makes no remote call. Fields not present in a change are
    /// left untouched on the remote. Records the remote changed after the
    /// stored watermark are not overwritten; their current remote versions
    /// are returned so the caller can resolve them.
    pub async fn push_changes(
        &self,
        changes: &[SyncChange],
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<SyncChange>> {
        let since = self.watermark.load()?;
        self.push_records(changes, SaveCondition::IfUnchangedSince(since), cancel).await
    }

    async fn push_records(
        &self,
        changes: &[SyncChange],
        condition: SaveCondition,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<SyncChange>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let zone = self.config.zone_name.as_str();
        let records: Vec<RemoteRecord> = changes.iter().map(RemoteRecord::from).collect();
        let report = self
            .call_remote("save_records", &self.config.push_retry, cancel, || {
                self.remote
                    .save_records(zone, &records, SavePolicy::ChangedKeysOnly, condition)
            })
            .await?;

        debug!(
            zone,
            saved = report.saved,
            refused = report.rejected.len(),
            "pushed changes"
        );
        Ok(report.rejected.into_iter().map(SyncChange::from).collect())
    }

    /// Pulls every remote change made after `since`, following cursors
    /// until the last page. `None` pulls everything.
    pub async fn pull_changes(
        &self,
        since: Option<Timestamp>,
        cancel: &CancellationToken,
    ) -> EngineResult<PulledChanges> {
        let zone = self.config.zone_name.as_str();
        let query = RecordQuery::changed_since(self.config.record_types.clone(), since)
            .with_limit(self.config.page_size);

        let mut page = self.query_page(&query, None, cancel).await?;
        let server_time = page.server_time;
        let mut changes = Vec::new();
        let mut pages = 1u32;
        loop {
            changes.extend(page.records.into_iter().map(SyncChange::from));
            debug!(zone, page = pages, total = changes.len(), "pulled page");

            match page.next_cursor {
                Some(next) => page = self.query_page(&query, Some(next), cancel).await?,
                None => break,
            }
            pages += 1;
        }

        Ok(PulledChanges {
            changes,
            server_time,
        })
    }

    async fn query_page(
        &self,
        query: &RecordQuery,
        cursor: Option<QueryCursor>,
        cancel: &CancellationToken,
    ) -> EngineResult<QueryPage> {
        let zone = self.config.zone_name.as_str();
        self.call_remote("query_records", &self.config.pull_retry, cancel, || {
            self.remote.query_records(zone, query, cursor.clone())
        })
        .await
    }

    /// Resolves `conflicts` with the current resolver and pushes the
    /// winning local or merged changes.
    ///
    /// Fails if the resolver fails or does not answer every conflict
    /// exactly once; nothing is pushed in that case.
    pub async fn resolve_conflicts(
        &self,
        conflicts: &[SyncConflict],
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<ConflictResolution>> {
        if conflicts.is_empty() {
            return Ok(Vec::new());
        }

        let resolver = Arc::clone(&*self.resolver.read());
        let resolutions = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            resolutions = resolver.resolve(conflicts) => resolutions?,
        };
        validate_resolutions(conflicts, &resolutions)?;

        let to_push: Vec<SyncChange> = resolutions
            .iter()
            .filter_map(|r| r.change_to_push().cloned())
            .collect();
        self.push_records(&to_push, SaveCondition::Overwrite, cancel).await?;

        info!(
            conflicts = conflicts.len(),
            repushed = to_push.len(),
            "resolved conflicts"
        );
        Ok(resolutions)
    }

    async fn run_pass(&self, cancel: &CancellationToken) -> EngineResult<SyncResult> {
        if !self.zone_ready.load(Ordering::Acquire) {
            self.set_state(SyncState::SettingUp);
            self.setup_zone(cancel).await?;
        }

        let since = self.watermark.load()?;
        let pending = self.local.pending_changes()?;
        debug!(?since, pending = pending.len(), "starting exchange");

        self.set_state(SyncState::Exchanging);
        let (refused, pulled) = tokio::try_join!(
            self.push_records(&pending, SaveCondition::IfUnchangedSince(since), cancel),
            self.pull_changes(since, cancel),
        )?;
        if !refused.is_empty() {
            debug!(refused = refused.len(), "remote changed records since last pass");
        }

        self.set_state(SyncState::Resolving);
        let remote = remote_view(&pulled.changes, refused);
        let conflicts = self.detector.detect(&pending, &remote);
        let resolutions = self.resolve_conflicts(&conflicts, cancel).await?;

        let to_apply = changes_to_apply(&pending, &remote, &resolutions);
        if !to_apply.is_empty() {
            self.local.apply_remote_changes(&to_apply)?;
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let watermark = since.map_or(pulled.server_time, |old| old.max(pulled.server_time));
        self.watermark.save(watermark)?;
        self.local.acknowledge(&pending)?;

        Ok(SyncResult {
            pushed_count: pending.len(),
            pulled_count: pulled.changes.len(),
            conflicts_resolved: resolutions.len(),
            timestamp: watermark,
        })
    }

    fn finish_pass(&self, outcome: &EngineResult<SyncResult>) {
        match outcome {
            Ok(result) => {
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.changes_pushed += result.pushed_count as u64;
                    stats.changes_pulled += result.pulled_count as u64;
                    stats.conflicts_resolved += result.conflicts_resolved as u64;
                    stats.last_sync = Some(result.timestamp);
                    stats.last_error = None;
                }
                self.set_state(SyncState::Synced);
                info!(
                    pushed = result.pushed_count,
                    pulled = result.pulled_count,
                    conflicts = result.conflicts_resolved,
                    watermark = %result.timestamp,
                    "sync pass complete"
                );
            }
            Err(e) if e.is_cancelled() => {
                self.set_state(SyncState::Idle);
                info!("sync pass cancelled");
            }
            Err(e) => {
                if matches!(e.root_cause(), SyncError::Remote(RemoteError::ZoneNotFound(_))) {
                    self.zone_ready.store(false, Ordering::Release);
                }
                {
                    let mut stats = self.stats.write();
                    stats.cycles_failed += 1;
                    stats.last_error = Some(e.to_string());
                }
                self.set_state(SyncState::Error);
                warn!(error = %e, "sync pass failed");
            }
        }
    }

    fn set_state(&self, state: SyncState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(?previous, ?state, "sync state changed");
        }
    }

    /// Runs one remote call under the circuit breaker and `retry`.
    async fn call_remote<T, F, Fut>(
        &self,
        op: &'static str,
        retry: &RetryConfig,
        cancel: &CancellationToken,
        operation: F,
    ) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !self.breaker.try_acquire() {
            debug!(op, "circuit open, not contacting remote");
            return Err(SyncError::CircuitOpen);
        }

        let breaker = &self.breaker;
        let operation = &operation;
        RetryExecutor::new(retry.clone())
            .execute(cancel, |attempt| async move {
                if attempt > 0 && !breaker.try_acquire() {
                    return Err(SyncError::CircuitOpen);
                }
                let outcome = operation().await;
                match &outcome {
                    Ok(_) => breaker.record_success(),
                    Err(e) if e.counts_as_failure() => breaker.record_failure(),
                    Err(_) => {}
                }
                outcome.map_err(SyncError::from)
            })
            .await
            .map_err(|err| {
                let err = SyncError::from(err);
                debug!(op, error = %err, "remote call failed");
                err
            })
    }
}

/// Pulled changes plus the remote versions that refused the push.
///
/// A record present in both keeps the later change.
fn remote_view(pulled: &[SyncChange], refused: Vec<SyncChange>) -> Vec<SyncChange> {
    let mut view = pulled.to_vec();
    let positions: HashMap<String, usize> = view
        .iter()
        .enumerate()
        .map(|(i, change)| (change.record_id().to_string(), i))
        .collect();

    for change in refused {
        match positions.get(change.record_id()) {
            Some(&i) if change.timestamp() > view[i].timestamp() => view[i] = change,
            Some(_) => {}
            None => view.push(change),
        }
    }
    view
}

/// Remote changes to apply locally after resolution.
///
/// Echoes of this pass's own pushes are skipped, records where the local
/// side won are skipped, and merged records apply the merged change.
fn changes_to_apply(
    pending: &[SyncChange],
    remote: &[SyncChange],
    resolutions: &[ConflictResolution],
) -> Vec<SyncChange> {
    let decisions: HashMap<&str, &ConflictResolution> =
        resolutions.iter().map(|r| (r.record_id(), r)).collect();

    let mut merged_applied = HashSet::new();
    let mut to_apply = Vec::new();
    for change in remote {
        match decisions.get(change.record_id()) {
            None if pending.iter().any(|local| change.includes(local)) => {}
            None => to_apply.push(change.clone()),
            Some(resolution) => match resolution.strategy() {
                ResolutionStrategy::UseRemote => to_apply.push(change.clone()),
                ResolutionStrategy::UseLocal => {}
                ResolutionStrategy::Merge => {
                    if let Some(merged) = resolution.merged_change() {
                        if merged_applied.insert(merged.record_id()) {
                            to_apply.push(merged.clone());
                        }
                    }
                }
            },
        }
    }
    to_apply
}

/// Marks a pass as running for as long as it lives.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

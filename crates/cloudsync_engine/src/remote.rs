//! Remote record store abstraction.
//!
//! The remote store partitions records into named zones, saves batches
//! with a changed-keys-only merge, serves cursor-paginated queries and
//! accepts change subscriptions. [`MemoryRemoteStore`] implements the
//! whole contract in memory for tests and offline use.
//!
//! Two clocks are involved. A record's `modified_at` is the writer's
//! change timestamp and decides last-write-wins. The store also stamps
//! every save with its own strictly increasing change time; queries
//! filter and page on that stamp, and saves can be made conditional on it.

use crate::change::{ChangeAction, SyncChange};
use crate::error::{RemoteError, RemoteResult};
use crate::value::{Timestamp, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

/// Largest page the remote serves.
pub const MAX_PAGE_SIZE: usize = 100;

/// A record as the remote store holds it.
///
/// Deletes are stored as tombstones so they replicate like other changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    /// Record identifier, unique within a zone.
    pub record_id: String,
    /// Record type.
    pub record_type: String,
    /// Last action applied to the record.
    pub action: ChangeAction,
    /// Field values.
    pub fields: BTreeMap<String, Value>,
    /// Timestamp of the change that last wrote the record.
    pub modified_at: Timestamp,
}

impl RemoteRecord {
    fn includes(&self, write: &RemoteRecord) -> bool {
        self.record_id == write.record_id
            && self.modified_at == write.modified_at
            && self.action == write.action
            && write
                .fields
                .iter()
                .all(|(key, value)| self.fields.get(key) == Some(value))
    }
}

impl From<&SyncChange> for RemoteRecord {
    fn from(change: &SyncChange) -> Self {
        Self {
            record_id: change.record_id().to_string(),
            record_type: change.record_type().to_string(),
            action: change.action(),
            fields: change.fields().clone(),
            modified_at: change.timestamp(),
        }
    }
}

impl From<RemoteRecord> for SyncChange {
    fn from(record: RemoteRecord) -> Self {
        SyncChange::new(
            record.record_id,
            record.record_type,
            record.action,
            record.modified_at,
        )
        .with_fields(record.fields)
    }
}

/// How a save combines with the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePolicy {
    /// Merge only the fields present in the write.
    #[default]
    ChangedKeysOnly,
    /// Replace the stored record.
    AllKeys,
}

/// Precondition for [`RemoteRecordStore::save_records`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveCondition {
    /// Save a record only if the store has not changed it after this
    /// server change time. `None` accepts only records the store does not
    /// hold yet. Records the store already holds an identical write for
    /// are accepted without change.
    IfUnchangedSince(Option<Timestamp>),
    /// Save unconditionally.
    Overwrite,
}

/// Outcome of [`RemoteRecordStore::save_records`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaveReport {
    /// Number of records accepted, including writes the store already held.
    pub saved: usize,
    /// Current server versions of records refused by the save condition.
    pub rejected: Vec<RemoteRecord>,
}

/// Predicate for [`RemoteRecordStore::query_records`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    /// Record types to return; empty means all.
    pub record_types: Vec<String>,
    /// Return only records whose server change time is strictly after
    /// this point.
    pub changed_after: Option<Timestamp>,
    /// Requested page size, capped at [`MAX_PAGE_SIZE`].
    pub limit: usize,
}

impl RecordQuery {
    /// Query for records of the given types changed after `since`.
    pub fn changed_since(record_types: Vec<String>, since: Option<Timestamp>) -> Self {
        Self {
            record_types,
            changed_after: since,
            limit: MAX_PAGE_SIZE,
        }
    }

    /// Sets the page size.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn matches(&self, stored: &StoredRecord) -> bool {
        let type_ok = self.record_types.is_empty()
            || self
                .record_types
                .iter()
                .any(|t| *t == stored.record.record_type);
        type_ok && stored.changed_after(self.changed_after)
    }
}

/// Opaque token for the next page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryCursor(pub String);

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage {
    /// Records in this page, most recently changed first.
    pub records: Vec<RemoteRecord>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<QueryCursor>,
    /// Server change time when the page was read. Every record changed
    /// later carries a greater change time.
    pub server_time: Timestamp,
}

/// Which mutations a subscription reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionEvents {
    /// Report creations.
    pub on_create: bool,
    /// Report updates.
    pub on_update: bool,
    /// Report deletions.
    pub on_delete: bool,
}

impl SubscriptionEvents {
    /// All mutation kinds.
    pub fn all() -> Self {
        Self {
            on_create: true,
            on_update: true,
            on_delete: true,
        }
    }
}

impl Default for SubscriptionEvents {
    fn default() -> Self {
        Self::all()
    }
}

/// A request to be notified of changes to one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSubscription {
    /// Stable subscription identifier.
    pub subscription_id: String,
    /// Record type to watch.
    pub record_type: String,
    /// Events to report.
    pub events: SubscriptionEvents,
}

impl ChangeSubscription {
    /// Subscription for every event on `record_type`.
    pub fn new(subscription_id: impl Into<String>, record_type: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            record_type: record_type.into(),
            events: SubscriptionEvents::all(),
        }
    }
}

/// Whether the remote account can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    /// Signed in and usable.
    Available,
    /// Signed out, restricted, or otherwise unusable.
    Unavailable,
}

/// The remote side of synchronization.
#[async_trait]
pub trait RemoteRecordStore: Send + Sync {
    /// Reports whether the account can be used.
    async fn account_status(&self) -> RemoteResult<AccountStatus>;

    /// Creates a zone. Fails with [`RemoteError::ZoneAlreadyExists`] if it exists.
    async fn create_zone(&self, zone: &str) -> RemoteResult<()>;

    /// Saves a batch of records in one call.
    ///
    /// Records refused by `condition` are reported in
    /// [`SaveReport::rejected`]; the rest of the batch is written. The
    /// condition is checked against the store as it was before the batch.
    async fn save_records(
        &self,
        zone: &str,
        records: &[RemoteRecord],
        policy: SavePolicy,
        condition: SaveCondition,
    ) -> RemoteResult<SaveReport>;

    /// Returns one page of matching records, most recently changed first.
    async fn query_records(
        &self,
        zone: &str,
        query: &RecordQuery,
        cursor: Option<QueryCursor>,
    ) -> RemoteResult<QueryPage>;

    /// Registers a subscription. Fails with
    /// [`RemoteError::SubscriptionAlreadyExists`] if the id is taken.
    async fn create_subscription(
        &self,
        zone: &str,
        subscription: &ChangeSubscription,
    ) -> RemoteResult<()>;
}

/// Operations of [`MemoryRemoteStore`], for failure injection and call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `account_status`.
    AccountStatus,
    /// `create_zone`.
    CreateZone,
    /// `save_records`.
    SaveRecords,
    /// `query_records`.
    QueryRecords,
    /// `create_subscription`.
    CreateSubscription,
}

#[derive(Debug)]
struct StoredRecord {
    record: RemoteRecord,
    changed_at: Timestamp,
}

impl StoredRecord {
    fn changed_after(&self, since: Option<Timestamp>) -> bool {
        since.map_or(true, |since| self.changed_at > since)
    }

    /// Position in query order: most recently changed first, then by id.
    fn sort_key(&self) -> (std::cmp::Reverse<Timestamp>, &str) {
        (std::cmp::Reverse(self.changed_at), self.record.record_id.as_str())
    }
}

#[derive(Debug, Default)]
struct Zone {
    records: BTreeMap<String, StoredRecord>,
    subscriptions: BTreeMap<String, ChangeSubscription>,
}

#[derive(Debug)]
struct MemoryState {
    account: AccountStatus,
    zones: BTreeMap<String, Zone>,
    queued_failures: HashMap<StoreOp, VecDeque<RemoteError>>,
    persistent_failures: HashMap<StoreOp, RemoteError>,
    calls: HashMap<StoreOp, u32>,
    latency: Option<Duration>,
    op_latency: HashMap<StoreOp, Duration>,
    clock: Option<Timestamp>,
}

/// Issues the next server change time, strictly after every earlier one.
fn tick(clock: &mut Option<Timestamp>) -> Timestamp {
    let now = Utc::now();
    let next = match *clock {
        Some(last) if now <= last => last + chrono::Duration::microseconds(1),
        _ => now,
    };
    *clock = Some(next);
    next
}

/// An in-memory remote store.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    state: Mutex<MemoryState>,
}

impl MemoryRemoteStore {
    /// Creates an empty store with an available account.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                account: AccountStatus::Available,
                zones: BTreeMap::new(),
                queued_failures: HashMap::new(),
                persistent_failures: HashMap::new(),
                calls: HashMap::new(),
                latency: None,
                op_latency: HashMap::new(),
                clock: None,
            }),
        }
    }

    /// Sets the reported account status.
    pub fn set_account_status(&self, status: AccountStatus) {
        self.state.lock().account = status;
    }

    /// Makes the next call to `op` fail with `error`. Calls queue up.
    pub fn inject_failure(&self, op: StoreOp, error: RemoteError) {
        self.state
            .lock()
            .queued_failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Makes every call to `op` fail with `error` until cleared.
    pub fn fail_always(&self, op: StoreOp, error: RemoteError) {
        self.state.lock().persistent_failures.insert(op, error);
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.queued_failures.clear();
        state.persistent_failures.clear();
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Delays calls to `op` by `latency`, overriding [`set_latency`](Self::set_latency).
    pub fn set_op_latency(&self, op: StoreOp, latency: Duration) {
        self.state.lock().op_latency.insert(op, latency);
    }

    /// Returns how many times `op` was called.
    pub fn calls(&self, op: StoreOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Stores a record as if another device had saved it, creating the
    /// zone if needed.
    pub fn insert_record(&self, zone: &str, record: RemoteRecord) {
        let mut state = self.state.lock();
        let changed_at = tick(&mut state.clock);
        state
            .zones
            .entry(zone.to_string())
            .or_default()
            .records
            .insert(record.record_id.clone(), StoredRecord { record, changed_at });
    }

    /// Returns a stored record.
    pub fn record(&self, zone: &str, record_id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .zones
            .get(zone)
            .and_then(|z| z.records.get(record_id))
            .map(|stored| stored.record.clone())
    }

    /// Returns the server change time of a stored record.
    pub fn changed_at(&self, zone: &str, record_id: &str) -> Option<Timestamp> {
        self.state
            .lock()
            .zones
            .get(zone)
            .and_then(|z| z.records.get(record_id))
            .map(|stored| stored.changed_at)
    }

    /// Returns the number of records in a zone.
    pub fn record_count(&self, zone: &str) -> usize {
        self.state
            .lock()
            .zones
            .get(zone)
            .map_or(0, |z| z.records.len())
    }

    /// Returns true if the zone exists.
    pub fn has_zone(&self, zone: &str) -> bool {
        self.state.lock().zones.contains_key(zone)
    }

    /// Returns the subscription ids registered in a zone.
    pub fn subscription_ids(&self, zone: &str) -> Vec<String> {
        self.state
            .lock()
            .zones
            .get(zone)
            .map(|z| z.subscriptions.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn enter(&self, op: StoreOp) -> RemoteResult<()> {
        let latency = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.op_latency.get(&op).copied().or(state.latency)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state
            .queued_failures
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        match state.persistent_failures.get(&op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteRecordStore for MemoryRemoteStore {
    async fn account_status(&self) -> RemoteResult<AccountStatus> {
        self.enter(StoreOp::AccountStatus).await?;
        Ok(self.state.lock().account)
    }

    async fn create_zone(&self, zone: &str) -> RemoteResult<()> {
        self.enter(StoreOp::CreateZone).await?;
        let mut state = self.state.lock();
        if state.zones.contains_key(zone) {
            return Err(RemoteError::ZoneAlreadyExists(zone.to_string()));
        }
        state.zones.insert(zone.to_string(), Zone::default());
        Ok(())
    }

    async fn save_records(
        &self,
        zone: &str,
        records: &[RemoteRecord],
        policy: SavePolicy,
        condition: SaveCondition,
    ) -> RemoteResult<SaveReport> {
        self.enter(StoreOp::SaveRecords).await?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let zone_state = state
            .zones
            .get_mut(zone)
            .ok_or_else(|| RemoteError::ZoneNotFound(zone.to_string()))?;

        let refused: BTreeSet<String> = match condition {
            SaveCondition::Overwrite => BTreeSet::new(),
            SaveCondition::IfUnchangedSince(since) => records
                .iter()
                .filter(|record| {
                    zone_state.records.get(&record.record_id).is_some_and(|stored| {
                        stored.changed_after(since) && !stored.record.includes(record)
                    })
                })
                .map(|record| record.record_id.clone())
                .collect(),
        };

        let mut report = SaveReport {
            saved: 0,
            rejected: refused
                .iter()
                .filter_map(|id| zone_state.records.get(id))
                .map(|stored| stored.record.clone())
                .collect(),
        };

        for record in records {
            if refused.contains(&record.record_id) {
                continue;
            }
            match (policy, zone_state.records.get_mut(&record.record_id)) {
                (SavePolicy::ChangedKeysOnly, Some(stored)) if stored.record.includes(record) => {}
                (SavePolicy::ChangedKeysOnly, Some(stored)) => {
                    stored.record.fields.extend(
                        record
                            .fields
                            .iter()
                            .map(|(key, value)| (key.clone(), value.clone())),
                    );
                    stored.record.record_type = record.record_type.clone();
                    stored.record.action = record.action;
                    stored.record.modified_at = record.modified_at;
                    stored.changed_at = tick(&mut state.clock);
                }
                _ => {
                    let changed_at = tick(&mut state.clock);
                    zone_state.records.insert(
                        record.record_id.clone(),
                        StoredRecord {
                            record: record.clone(),
                            changed_at,
                        },
                    );
                }
            }
            report.saved += 1;
        }
        Ok(report)
    }

    async fn query_records(
        &self,
        zone: &str,
        query: &RecordQuery,
        cursor: Option<QueryCursor>,
    ) -> RemoteResult<QueryPage> {
        self.enter(StoreOp::QueryRecords).await?;
        let after = cursor.as_ref().map(decode_cursor).transpose()?;

        let mut state = self.state.lock();
        let server_time = tick(&mut state.clock);
        let zone_state = state
            .zones
            .get(zone)
            .ok_or_else(|| RemoteError::ZoneNotFound(zone.to_string()))?;

        let mut matching: Vec<&StoredRecord> = zone_state
            .records
            .values()
            .filter(|stored| query.matches(stored))
            .filter(|stored| {
                after.as_ref().map_or(true, |(changed_at, id)| {
                    stored.sort_key() > (std::cmp::Reverse(*changed_at), id.as_str())
                })
            })
            .collect();
        matching.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let page_size = query.limit.clamp(1, MAX_PAGE_SIZE);
        let next_cursor = (matching.len() > page_size)
            .then(|| encode_cursor(matching[page_size - 1]));
        let records = matching
            .into_iter()
            .take(page_size)
            .map(|stored| stored.record.clone())
            .collect();

        Ok(QueryPage {
            records,
            next_cursor,
            server_time,
        })
    }

    async fn create_subscription(
        &self,
        zone: &str,
        subscription: &ChangeSubscription,
    ) -> RemoteResult<()> {
        self.enter(StoreOp::CreateSubscription).await?;
        let mut state = self.state.lock();
        let zone_state = state
            .zones
            .get_mut(zone)
            .ok_or_else(|| RemoteError::ZoneNotFound(zone.to_string()))?;

        if zone_state
            .subscriptions
            .contains_key(&subscription.subscription_id)
        {
            return Err(RemoteError::SubscriptionAlreadyExists(
                subscription.subscription_id.clone(),
            ));
        }
        zone_state
            .subscriptions
            .insert(subscription.subscription_id.clone(), subscription.clone());
        Ok(())
    }
}

/// Cursors name the last record served, so pages stay stable while
/// records change between requests.
fn encode_cursor(last: &StoredRecord) -> QueryCursor {
    QueryCursor(format!(
        "{}/{}",
        last.changed_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        last.record.record_id
    ))
}

fn decode_cursor(cursor: &QueryCursor) -> RemoteResult<(Timestamp, String)> {
    let invalid = || RemoteError::Rejected(format!("invalid cursor: {}", cursor.0));
    let (changed_at, record_id) = cursor.0.split_once('/').ok_or_else(invalid)?;
    let changed_at = chrono::DateTime::parse_from_rfc3339(changed_at)
        .map_err(|_| invalid())?
        .with_timezone(&Utc);
    Ok((changed_at, record_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const ZONE: &str = "Inventory";

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(id: &str, secs: i64) -> RemoteRecord {
        RemoteRecord::from(&SyncChange::update(id, "Item", at(secs)).with_field("name", id))
    }

    #[tokio::test]
    async fn zone_and_subscription_are_exclusive() {
        let store = MemoryRemoteStore::new();
        store.create_zone(ZONE).await.unwrap();
        assert_eq!(
            store.create_zone(ZONE).await,
            Err(RemoteError::ZoneAlreadyExists(ZONE.into()))
        );

        let sub = ChangeSubscription::new("Item-changes", "Item");
        store.create_subscription(ZONE, &sub).await.unwrap();
        assert!(matches!(
            store.create_subscription(ZONE, &sub).await,
            Err(RemoteError::SubscriptionAlreadyExists(_))
        ));
        assert_eq!(store.subscription_ids(ZONE), vec!["Item-changes".to_string()]);
    }

    fn ids(page: &QueryPage) -> Vec<&str> {
        page.records.iter().map(|r| r.record_id.as_str()).collect()
    }

    async fn overwrite(store: &MemoryRemoteStore, change: &SyncChange, policy: SavePolicy) {
        store
            .save_records(
                ZONE,
                &[RemoteRecord::from(change)],
                policy,
                SaveCondition::Overwrite,
            )
            .await
            .unwrap();
    }

    async fn save_unless_changed(store: &MemoryRemoteStore, write: &[RemoteRecord]) -> SaveReport {
        store
            .save_records(
                ZONE,
                write,
                SavePolicy::ChangedKeysOnly,
                SaveCondition::IfUnchangedSince(None),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn save_requires_zone() {
        let store = MemoryRemoteStore::new();
        let result = store
            .save_records(
                ZONE,
                &[record("a", 1)],
                SavePolicy::ChangedKeysOnly,
                SaveCondition::Overwrite,
            )
            .await;
        assert_eq!(result, Err(RemoteError::ZoneNotFound(ZONE.into())));
    }

    #[tokio::test]
    async fn changed_keys_only_keeps_untouched_fields() {
        let store = MemoryRemoteStore::new();
        store.create_zone(ZONE).await.unwrap();

        let full = SyncChange::create("drill", "Item", at(1))
            .with_field("name", "Drill")
            .with_field("room", "Garage");
        overwrite(&store, &full, SavePolicy::ChangedKeysOnly).await;

        let partial = SyncChange::update("drill", "Item", at(2)).with_field("room", "Basement");
        overwrite(&store, &partial, SavePolicy::ChangedKeysOnly).await;

        let stored = store.record(ZONE, "drill").unwrap();
        assert_eq!(stored.fields["name"], Value::from("Drill"));
        assert_eq!(stored.fields["room"], Value::from("Basement"));
        assert_eq!(stored.action, ChangeAction::Update);
        assert_eq!(stored.modified_at, at(2));

        overwrite(&store, &partial, SavePolicy::AllKeys).await;
        assert!(!store.record(ZONE, "drill").unwrap().fields.contains_key("name"));
    }

    #[tokio::test]
    async fn conditional_save_refuses_records_changed_since() {
        let store = MemoryRemoteStore::new();
        store.insert_record(ZONE, record("seen", 1));
        let since = store.changed_at(ZONE, "seen");
        store.insert_record(ZONE, record("theirs", 100));

        let report = store
            .save_records(
                ZONE,
                &[record("seen", 5), record("theirs", 50), record("new", 7)],
                SavePolicy::ChangedKeysOnly,
                SaveCondition::IfUnchangedSince(since),
            )
            .await
            .unwrap();

        assert_eq!(report.saved, 2);
        assert_eq!(report.rejected, vec![record("theirs", 100)]);
        assert_eq!(store.record(ZONE, "theirs").unwrap().modified_at, at(100));
        assert_eq!(store.record(ZONE, "seen").unwrap().modified_at, at(5));
        assert!(store.record(ZONE, "new").is_some());
    }

    #[tokio::test]
    async fn first_save_refuses_every_existing_record() {
        let store = MemoryRemoteStore::new();
        store.insert_record(ZONE, record("a", 1));

        let report = save_unless_changed(&store, &[record("a", 9)]).await;
        assert_eq!(report.saved, 0);
        assert_eq!(report.rejected.len(), 1);
    }

    #[tokio::test]
    async fn repeated_write_is_accepted_without_restamping() {
        let store = MemoryRemoteStore::new();
        store.create_zone(ZONE).await.unwrap();
        let write = [record("a", 3)];

        save_unless_changed(&store, &write).await;
        let stamped = store.changed_at(ZONE, "a");

        let report = save_unless_changed(&store, &write).await;
        assert!(report.rejected.is_empty());
        assert_eq!(report.saved, 1);
        assert_eq!(store.changed_at(ZONE, "a"), stamped);
    }

    #[tokio::test]
    async fn query_pages_most_recently_changed_first() {
        let store = MemoryRemoteStore::new();
        for i in 0..5 {
            store.insert_record(ZONE, record(&format!("r{i}"), i));
        }

        let query = RecordQuery::changed_since(vec!["Item".into()], None).with_limit(2);
        let first = store.query_records(ZONE, &query, None).await.unwrap();
        assert_eq!(ids(&first), vec!["r4", "r3"]);

        let second = store
            .query_records(ZONE, &query, first.next_cursor)
            .await
            .unwrap();
        assert_eq!(ids(&second), vec!["r2", "r1"]);
        assert!(second.server_time > first.server_time);

        let third = store
            .query_records(ZONE, &query, second.next_cursor)
            .await
            .unwrap();
        assert_eq!(ids(&third), vec!["r0"]);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn query_filters_on_server_change_time() {
        let store = MemoryRemoteStore::new();
        store.insert_record(ZONE, record("before", 500));
        let query = RecordQuery::changed_since(Vec::new(), None);
        let since = store.query_records(ZONE, &query, None).await.unwrap().server_time;

        // Written later, but carrying an older change timestamp.
        store.insert_record(ZONE, record("offline-edit", 1));

        let query = RecordQuery::changed_since(Vec::new(), Some(since));
        let page = store.query_records(ZONE, &query, None).await.unwrap();
        assert_eq!(ids(&page), vec!["offline-edit"]);
    }

    #[tokio::test]
    async fn cursor_is_stable_across_changes_between_pages() {
        let store = MemoryRemoteStore::new();
        for i in 0..5 {
            store.insert_record(ZONE, record(&format!("r{i}"), i));
        }
        let query = RecordQuery::changed_since(Vec::new(), None).with_limit(2);
        let first = store.query_records(ZONE, &query, None).await.unwrap();
        assert_eq!(ids(&first), vec!["r4", "r3"]);

        // r1 moves ahead of the cursor; nothing after it shifts.
        store.insert_record(ZONE, record("r1", 10));

        let second = store
            .query_records(ZONE, &query, first.next_cursor.clone())
            .await
            .unwrap();
        assert_eq!(ids(&second), vec!["r2", "r0"]);
        assert!(second.next_cursor.is_none());

        let later = RecordQuery::changed_since(Vec::new(), Some(first.server_time));
        let page = store.query_records(ZONE, &later, None).await.unwrap();
        assert_eq!(ids(&page), vec!["r1"]);
    }

    #[tokio::test]
    async fn bad_cursor_is_rejected() {
        let store = MemoryRemoteStore::new();
        store.insert_record(ZONE, record("a", 1));
        let query = RecordQuery::changed_since(Vec::new(), None);
        for token in ["zzz", "not-a-time/a"] {
            let result = store
                .query_records(ZONE, &query, Some(QueryCursor(token.into())))
                .await;
            assert!(matches!(result, Err(RemoteError::Rejected(_))));
        }
    }

    #[tokio::test]
    async fn page_size_is_capped() {
        let store = MemoryRemoteStore::new();
        for i in 0..150 {
            store.insert_record(ZONE, record(&format!("r{i:03}"), i));
        }
        let query = RecordQuery::changed_since(Vec::new(), None).with_limit(500);
        let page = store.query_records(ZONE, &query, None).await.unwrap();
        assert_eq!(page.records.len(), MAX_PAGE_SIZE);
        assert!(page.next_cursor.is_some());

        let rest = store
            .query_records(ZONE, &query, page.next_cursor)
            .await
            .unwrap();
        assert_eq!(rest.records.len(), 50);
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemoryRemoteStore::new();
        store.inject_failure(StoreOp::AccountStatus, RemoteError::Timeout);
        assert_eq!(store.account_status().await, Err(RemoteError::Timeout));
        assert_eq!(store.account_status().await, Ok(AccountStatus::Available));

        store.fail_always(StoreOp::CreateZone, RemoteError::Network("down".into()));
        assert!(store.create_zone(ZONE).await.is_err());
        assert!(store.create_zone(ZONE).await.is_err());
        store.clear_failures();
        assert!(store.create_zone(ZONE).await.is_ok());

        assert_eq!(store.calls(StoreOp::AccountStatus), 2);
        assert_eq!(store.calls(StoreOp::CreateZone), 3);
    }

    #[test]
    fn record_change_conversion() {
        let change = SyncChange::delete("gone", "Item", at(9)).with_field("reason", "sold");
        let back = SyncChange::from(RemoteRecord::from(&change));
        assert_eq!(back, change);
    }
}

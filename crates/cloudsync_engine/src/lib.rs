//! # cloudsync engine
//!
//! Offline-first synchronization between a local store and a remote
//! record store.
//!
//! This crate provides:
//! - Typed change records (`SyncChange`, `Value`)
//! - Conflict detection and pluggable resolution
//! - A remote record store contract with an in-memory implementation
//! - Durable sync watermarks (memory and JSON file)
//! - The sync engine: concurrent push/pull, resolution, watermark commit
//!
//! ## Architecture
//!
//! Each pass pushes queued local changes and pulls remote changes newer
//! than the watermark **concurrently**, then resolves conflicts between
//! the two sets. Every remote call goes through the engine's circuit
//! breaker and a bounded retry policy from `cloudsync_net`.
//!
//! ## Key Invariants
//!
//! - The watermark never decreases and is measured on the remote's clock
//! - A push never replaces a record the remote changed since the last
//!   pass; such records always reach the conflict resolver
//! - The watermark advances only after a pass fully succeeds
//! - Conflict resolution runs after both push and pull complete
//! - Cancellation is not a failure: it never trips the breaker
//! - At most one pass runs per engine at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod config;
mod conflict;
mod engine;
mod error;
mod local;
mod remote;
mod state;
mod value;
mod watermark;

pub use change::{ChangeAction, SyncChange};
pub use config::SyncConfig;
pub use conflict::{
    ConflictDetector, ConflictPolicy, ConflictResolution, ConflictResolver, ResolutionStrategy,
    SyncConflict,
};
pub use engine::SyncEngine;
pub use error::{EngineResult, RemoteError, RemoteResult, SyncError};
pub use local::{LocalStore, MemoryLocalStore};
pub use remote::{
    AccountStatus, ChangeSubscription, MemoryRemoteStore, QueryCursor, QueryPage, RecordQuery,
    RemoteRecord, RemoteRecordStore, SaveCondition, SavePolicy, SaveReport, StoreOp,
    SubscriptionEvents, MAX_PAGE_SIZE,
};
pub use state::{PulledChanges, SyncResult, SyncState, SyncStats};
pub use value::{Timestamp, Value};
pub use watermark::{JsonFileWatermarkStore, MemoryWatermarkStore, WatermarkStore};

pub use cloudsync_net::{BreakerConfig, CancellationToken, CircuitBreaker, CircuitState, RetryConfig};

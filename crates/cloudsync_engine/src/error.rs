//! Error types for the sync engine.

use cloudsync_net::{RetryError, Retryable};
use std::io;
use thiserror::Error;

/// Result type for sync operations.
pub type EngineResult<T> = Result<T, SyncError>;

/// Result type for remote store calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors reported by a [`RemoteRecordStore`](crate::RemoteRecordStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The zone already exists.
    #[error("zone already exists: {0}")]
    ZoneAlreadyExists(String),

    /// A subscription with this identifier already exists.
    #[error("subscription already exists: {0}")]
    SubscriptionAlreadyExists(String),

    /// The zone does not exist.
    #[error("zone not found: {0}")]
    ZoneNotFound(String),

    /// The remote account or session cannot be used.
    #[error("remote account unavailable")]
    AccountUnavailable,

    /// The request timed out.
    #[error("remote request timed out")]
    Timeout,

    /// The network path to the remote failed.
    #[error("network failure: {0}")]
    Network(String),

    /// The remote service is temporarily unavailable or overloaded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Client and server disagree on version or checksum.
    #[error("incompatible remote: {0}")]
    Incompatible(String),

    /// The remote rejected the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Returns true if another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Timeout | RemoteError::Network(_) | RemoteError::ServiceUnavailable(_)
        )
    }

    /// Returns true if this outcome should count against the circuit breaker.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            RemoteError::Timeout
                | RemoteError::Network(_)
                | RemoteError::ServiceUnavailable(_)
                | RemoteError::Rejected(_)
        )
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote account is not in a usable state.
    #[error("remote unavailable: account cannot be used for sync")]
    RemoteUnavailable,

    /// The remote store failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The circuit breaker is open; the remote was not contacted.
    #[error("circuit breaker open: remote considered down")]
    CircuitOpen,

    /// A retried remote operation failed on every attempt.
    #[error("too many retries: gave up after {attempts} attempts, last error: {last}")]
    TooManyRetries {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last: Box<SyncError>,
    },

    /// The pass was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The conflict resolver failed.
    #[error("conflict resolver failed: {0}")]
    Resolver(String),

    /// The resolver did not return exactly one resolution per conflict.
    #[error("incomplete resolution: {expected} conflicts, {actual} resolutions")]
    IncompleteResolution {
        /// Number of conflicts handed to the resolver.
        expected: usize,
        /// Number of resolutions returned.
        actual: usize,
    },

    /// A resolution is malformed or does not match its conflict.
    #[error("invalid resolution for record {record_id}: {reason}")]
    InvalidResolution {
        /// Record the resolution refers to.
        record_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The local store failed.
    #[error("local store error: {0}")]
    Local(String),

    /// The watermark could not be read or written.
    #[error("watermark error: {0}")]
    Watermark(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another sync pass is already running on this engine.
    #[error("sync already in progress")]
    SyncInProgress,
}

impl SyncError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the pass stopped because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Returns the root cause, looking through `TooManyRetries`.
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::TooManyRetries { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        SyncError::is_retryable(self)
    }
}

impl From<RetryError<SyncError>> for SyncError {
    fn from(err: RetryError<SyncError>) -> Self {
        match err {
            RetryError::Cancelled => SyncError::Cancelled,
            RetryError::Aborted(e) => e,
            RetryError::Exhausted { attempts, last } => SyncError::TooManyRetries {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

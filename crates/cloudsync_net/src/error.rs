//! Error types for the resilient network client.

use thiserror::Error;

/// Result type for network operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur while executing a request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetError {
    /// The device has no usable network path right now.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// The circuit breaker is open; the request was not attempted.
    #[error("circuit breaker open: remote considered down")]
    CircuitOpen,

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-2xx status.
    #[error("http status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// Connection-level failure (reset, DNS, TLS, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The request could not be built (bad URL, bad header).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The operation was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    /// All retry attempts failed.
    #[error("too many retries: gave up after {attempts} attempts, last error: {last}")]
    TooManyRetries {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last: Box<NetError>,
    },

    /// The response arrived but could not be decoded.
    #[error("decoding error: {0}")]
    Decoding(String),
}

impl NetError {
    /// Creates a status error.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Returns true if another attempt could succeed.
    ///
    /// Timeouts, 5xx responses and transport failures are transient.
    /// 4xx responses, cancellation, decoding failures and an open circuit
    /// are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::Timeout | NetError::Transport(_) => true,
            NetError::Status { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    /// Returns true if this outcome should count against the circuit breaker.
    ///
    /// Only requests that actually reached the wire and failed are counted.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            NetError::Timeout | NetError::Transport(_) | NetError::Status { .. }
        )
    }

    /// Returns the HTTP status code, if this is a status error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            NetError::Status { status, .. } => Some(*status),
            NetError::TooManyRetries { last, .. } => last.status_code(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for NetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetError::Timeout
        } else if err.is_builder() {
            NetError::InvalidRequest(err.to_string())
        } else if let Some(status) = err.status() {
            NetError::status(status.as_u16(), err.to_string())
        } else {
            NetError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        NetError::Decoding(err.to_string())
    }
}

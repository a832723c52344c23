//! Configuration for the sync engine.

use crate::remote::MAX_PAGE_SIZE;
use cloudsync_net::{BreakerConfig, RetryConfig};

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name of the remote zone.
    pub zone_name: String,
    /// Record types to subscribe to and pull.
    pub record_types: Vec<String>,
    /// Records requested per pull page.
    pub page_size: usize,
    /// Retry policy for writes.
    pub push_retry: RetryConfig,
    /// Retry policy for each pull page.
    pub pull_retry: RetryConfig,
    /// Retry policy for zone and subscription setup.
    pub setup_retry: RetryConfig,
    /// Circuit breaker guarding remote calls.
    pub breaker: BreakerConfig,
}

impl SyncConfig {
    /// Creates a configuration for `zone_name`.
    pub fn new(zone_name: impl Into<String>) -> Self {
        Self {
            zone_name: zone_name.into(),
            record_types: Vec::new(),
            page_size: MAX_PAGE_SIZE,
            push_retry: RetryConfig::aggressive(),
            pull_retry: RetryConfig::standard(),
            setup_retry: RetryConfig::standard(),
            breaker: BreakerConfig::default(),
        }
    }

    /// Adds a tracked record type.
    pub fn with_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_types.push(record_type.into());
        self
    }

    /// Sets the pull page size. Clamped to `1..=100`.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Sets the push retry policy.
    pub fn with_push_retry(mut self, retry: RetryConfig) -> Self {
        self.push_retry = retry;
        self
    }

    /// Sets the pull retry policy.
    pub fn with_pull_retry(mut self, retry: RetryConfig) -> Self {
        self.pull_retry = retry;
        self
    }

    /// Sets the setup retry policy.
    pub fn with_setup_retry(mut self, retry: RetryConfig) -> Self {
        self.setup_retry = retry;
        self
    }

    /// Sets the circuit breaker configuration.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Subscription identifier for a record type.
    pub fn subscription_id(&self, record_type: &str) -> String {
        format!("{record_type}-changes")
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("Inventory")
    }
}

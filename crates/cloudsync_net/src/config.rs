//! Configuration for the resilient client.

use std::time::Duration;

/// Configuration for a [`ResilientHttpClient`](crate::ResilientHttpClient).
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Base URL every endpoint path is resolved against.
    pub base_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Retry policy used when a call does not supply its own.
    pub retry: RetryConfig,
    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,
}

impl NetConfig {
    /// Creates a new configuration for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("cloudsync/", env!("CARGO_PKG_VERSION")).to_string(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the default retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit breaker configuration.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new("http://localhost")
    }
}

/// Thresholds for the circuit breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures (while closed) that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes (while half-open) that close the circuit.
    pub success_threshold: u32,
    /// Cooldown before an open circuit admits a probe.
    pub timeout: Duration,
}

impl BreakerConfig {
    /// Sets the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Sets the success threshold.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Sets the open-state cooldown.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for retry behavior.
///
/// The delay after failed attempt `n` (0-indexed) is
/// `min(base_delay * 2^n, max_delay) * jitter`, where `jitter` is drawn
/// uniformly from `jitter_range`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,
    /// Multiplicative jitter bounds `(low, high)`.
    pub jitter_range: (f64, f64),
}

impl RetryConfig {
    /// Creates a new retry configuration with standard delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::standard()
        }
    }

    /// General-purpose policy: 3 attempts, 1s base, 30s cap.
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_range: (0.8, 1.2),
        }
    }

    /// Policy for write paths that must not drop user data.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter_range: (0.9, 1.1),
        }
    }

    /// Policy for background reads that can wait for the next pass.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter_range: (0.5, 1.0),
        }
    }

    /// Creates a configuration with no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_range: (1.0, 1.0),
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter range. Bounds are reordered if given backwards and
    /// clamped to be non-negative.
    pub fn with_jitter_range(mut self, low: f64, high: f64) -> Self {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        self.jitter_range = (low.max(0.0), high.max(0.0));
        self
    }

    /// Returns the un-jittered delay after failed attempt `attempt`.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(62) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Returns the jittered delay after failed attempt `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let (low, high) = self.jitter_range;
        let jitter = if high > low {
            rand::Rng::gen_range(&mut rand::thread_rng(), low..=high)
        } else {
            low
        };
        self.base_delay_for_attempt(attempt).mul_f64(jitter)
    }

    /// Upper bound on the total time spent sleeping across all attempts.
    pub fn max_total_delay(&self) -> Duration {
        self.max_delay
            .mul_f64(self.jitter_range.1)
            .saturating_mul(self.max_attempts)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_config_builder() {
        let config = NetConfig::new("https://rates.example.com")
            .with_request_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig::none())
            .with_breaker(BreakerConfig::default().with_failure_threshold(3));

        assert_eq!(config.base_url, "https://rates.example.com");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.success_threshold, 2);
    }

    #[test]
    fn breaker_defaults() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn retry_delay_doubles() {
        let config = RetryConfig::new(5)
            .with_base_delay(Duration::from_millis(100))
            .with_jitter_range(1.0, 1.0);

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter_range(0.5, 1.5);

        for attempt in 0..40 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay <= Duration::from_millis(7500));
        }
        assert_eq!(config.base_delay_for_attempt(30), Duration::from_secs(5));
    }

    #[test]
    fn jitter_range_is_normalized() {
        let config = RetryConfig::none().with_jitter_range(1.5, -0.5);
        assert_eq!(config.jitter_range, (0.0, 1.5));
    }

    #[test]
    fn presets() {
        assert_eq!(RetryConfig::default(), RetryConfig::standard());
        assert!(RetryConfig::aggressive().max_attempts > RetryConfig::standard().max_attempts);
        assert_eq!(RetryConfig::none().max_total_delay(), Duration::ZERO);
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }
}

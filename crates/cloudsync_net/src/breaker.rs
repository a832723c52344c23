//! Circuit breaker for a logical remote endpoint.
//!
//! ```text
//!            failures >= failure_threshold
//!   Closed ─────────────────────────────────▶ Open
//!     ▲                                        │  ▲
//!     │ successes >= success_threshold         │  │ any failure
//!     │                          cooldown over │  │
//!     └──────────────── HalfOpen ◀─────────────┘  │
//!                          └──────────────────────┘
//! ```
//!
//! All state lives behind one mutex so every check-then-act sequence is a
//! single critical section.

use crate::config::BreakerConfig;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, all requests permitted.
    Closed,
    /// Failing fast, requests rejected without being attempted.
    Open,
    /// Cooldown elapsed, probe requests permitted.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

/// Tracks consecutive failures and successes and gates new attempts.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Returns the endpoint name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the breaker configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Asks permission to issue a request.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// admits the caller.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure_time
                    .map_or(true, |at| at.elapsed() > self.config.timeout);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!(breaker = %self.name, "circuit half-open, admitting probe");
                }
                cooled_down
            }
        }
    }

    /// Returns true if a request would currently be permitted.
    ///
    /// Same as [`try_acquire`](Self::try_acquire), including the
    /// open-to-half-open transition.
    pub fn can_execute(&self) -> bool {
        self.try_acquire()
    }

    /// Records a successful request.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_failure_time = None;
                    info!(breaker = %self.name, "circuit closed");
                } else {
                    debug!(
                        breaker = %self.name,
                        successes = inner.success_count,
                        "half-open probe succeeded"
                    );
                }
            }
            // A late success from a request issued before the circuit
            // opened does not close it.
            CircuitState::Open => {}
        }
    }

    /// Records a failed request.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_failure_time = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.last_failure_time = Some(Instant::now());
                warn!(breaker = %self.name, "half-open probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns the consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Returns the consecutive half-open success count.
    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    /// Forces the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        debug!(breaker = %self.name, "circuit manually reset");
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("default", BreakerConfig::default())
    }
}

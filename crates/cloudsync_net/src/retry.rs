//! Bounded exponential-backoff retry.

use crate::config::RetryConfig;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    /// Returns true if the operation may be retried after this error.
    fn is_retryable(&self) -> bool;
}

impl Retryable for crate::NetError {
    fn is_retryable(&self) -> bool {
        crate::NetError::is_retryable(self)
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// The cancellation token fired during an attempt or a backoff sleep.
    Cancelled,
    /// An attempt failed with a non-retryable error.
    Aborted(E),
    /// Every attempt failed with a retryable error.
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Maps the inner error type.
    pub fn map<F, U>(self, f: F) -> RetryError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            RetryError::Cancelled => RetryError::Cancelled,
            RetryError::Aborted(e) => RetryError::Aborted(f(e)),
            RetryError::Exhausted { attempts, last } => RetryError::Exhausted {
                attempts,
                last: f(last),
            },
        }
    }
}

impl From<RetryError<crate::NetError>> for crate::NetError {
    fn from(err: RetryError<crate::NetError>) -> Self {
        match err {
            RetryError::Cancelled => crate::NetError::Cancelled,
            RetryError::Aborted(e) => e,
            RetryError::Exhausted { attempts, last } => crate::NetError::TooManyRetries {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

/// Runs an async operation under a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Creates an executor for the given policy.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the retry policy.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Executes `operation` until it succeeds, fails with a non-retryable
    /// error, exhausts `max_attempts`, or `cancel` fires.
    ///
    /// The closure receives the 0-indexed attempt number. Each attempt and
    /// each backoff sleep races against the token; a cancelled attempt's
    /// future is dropped without producing an outcome.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = operation(attempt) => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                debug!(%error, "non-retryable error");
                return Err(RetryError::Aborted(error));
            }

            if attempt + 1 >= max_attempts {
                warn!(attempts = max_attempts, %error, "all attempts failed, giving up");
                return Err(RetryError::Exhausted {
                    attempts: max_attempts,
                    last: error,
                });
            }

            let delay = self.config.delay_for_attempt(attempt);
            debug!(attempt = attempt + 1, ?delay, %error, "attempt failed, backing off");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetError;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn fast(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(max_attempts)
                .with_base_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(50)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = fast(5)
            .execute(&CancellationToken::new(), |_| {
                let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if count < 3 {
                        Err(NetError::Timeout)
                    } else {
                        Ok("rates")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("rates"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), _> = fast(5)
            .execute(&CancellationToken::new(), |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(NetError::status(404, "not found")) }
            })
            .await;

        assert_eq!(
            result,
            Err(RetryError::Aborted(NetError::status(404, "not found")))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_converts_to_too_many_retries() {
        let result: Result<(), _> = fast(3)
            .execute(&CancellationToken::new(), |_| async {
                Err(NetError::status(503, "unavailable"))
            })
            .await;

        let err: NetError = result.unwrap_err().into();
        assert!(matches!(err, NetError::TooManyRetries { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let executor = RetryExecutor::new(
            RetryConfig::new(5).with_base_delay(Duration::from_secs(10)),
        );
        let handle = tokio::spawn(async move {
            executor
                .execute(&cancel, |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(NetError::Timeout) }
                })
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();

        assert_eq!(handle.await.unwrap(), Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = fast(3)
            .execute(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NetError::Timeout) }
            })
            .await;

        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn attempts_and_sleep_are_bounded(
            max_attempts in 1u32..7,
            base_ms in 1u64..200,
            max_ms in 1u64..500,
            low in 0.0f64..1.0,
            spread in 0.0f64..1.0,
        ) {
            let config = RetryConfig::new(max_attempts)
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(max_ms))
                .with_jitter_range(low, low + spread);
            let bound = config.max_total_delay();
            let executor = RetryExecutor::new(config);

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let (calls, elapsed, result) = runtime.block_on(async move {
                let calls = Arc::new(AtomicU32::new(0));
                let counter = Arc::clone(&calls);
                let start = Instant::now();
                let result: Result<(), _> = executor
                    .execute(&CancellationToken::new(), |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async { Err(NetError::Transport("reset".into())) }
                    })
                    .await;
                (calls.load(Ordering::SeqCst), start.elapsed(), result)
            });

            prop_assert_eq!(calls, max_attempts);
            let is_exhausted = matches!(result, Err(RetryError::Exhausted { .. }));
            prop_assert!(is_exhausted);
            prop_assert!(elapsed <= bound + Duration::from_millis(1));
        }
    }
}

//! Resilient HTTP client.
//!
//! Composes reachability, a circuit breaker and bounded retry around an
//! [`HttpClient`]:
//!
//! 1. Resolve the endpoint (invalid requests fail before anything else)
//! 2. Fail fast with `NetworkUnavailable` if the device is offline
//! 3. Fail fast with `CircuitOpen` if the breaker rejects the call
//! 4. Attempt, classify, record on the breaker, back off, repeat
//! 5. Decode, only after the bytes have arrived

use crate::breaker::CircuitBreaker;
use crate::config::{NetConfig, RetryConfig};
use crate::decode::{JsonDecoder, ResponseDecoder};
use crate::error::{NetError, NetResult};
use crate::http::{Endpoint, HttpClient, HttpResponse, ReqwestClient};
use crate::reachability::{AlwaysReachable, Reachability};
use crate::retry::RetryExecutor;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// HTTP client with fail-fast circuit breaking and exponential backoff.
pub struct ResilientHttpClient<C, R = AlwaysReachable, D = JsonDecoder> {
    config: NetConfig,
    client: C,
    reachability: R,
    decoder: D,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientHttpClient<ReqwestClient> {
    /// Creates a client backed by `reqwest`.
    pub fn from_config(config: NetConfig) -> NetResult<Self> {
        let client = ReqwestClient::new(&config)?;
        Ok(Self::new(config, client))
    }
}

impl<C: HttpClient> ResilientHttpClient<C> {
    /// Creates a client over the given transport.
    pub fn new(config: NetConfig, client: C) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.base_url.clone(), config.breaker));
        Self {
            config,
            client,
            reachability: AlwaysReachable,
            decoder: JsonDecoder,
            breaker,
        }
    }
}

impl<C, R, D> ResilientHttpClient<C, R, D>
where
    C: HttpClient,
    R: Reachability,
    D: ResponseDecoder,
{
    /// Replaces the reachability probe.
    pub fn with_reachability<R2: Reachability>(self, reachability: R2) -> ResilientHttpClient<C, R2, D> {
        ResilientHttpClient {
            config: self.config,
            client: self.client,
            reachability,
            decoder: self.decoder,
            breaker: self.breaker,
        }
    }

    /// Replaces the response decoder.
    pub fn with_decoder<D2: ResponseDecoder>(self, decoder: D2) -> ResilientHttpClient<C, R, D2> {
        ResilientHttpClient {
            config: self.config,
            client: self.client,
            reachability: self.reachability,
            decoder,
            breaker: self.breaker,
        }
    }

    /// Shares an existing breaker, so several clients for the same remote
    /// trip together.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Returns the circuit breaker guarding this client.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Returns the configuration.
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> &C {
        &self.client
    }

    /// Executes `endpoint` under `retry` and returns the raw 2xx body.
    pub async fn request(
        &self,
        endpoint: &Endpoint,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> NetResult<Bytes> {
        let request = endpoint.to_request(&self.config.base_url)?;

        if !self.reachability.is_reachable() {
            debug!(url = %request.url, "network unreachable, not attempting");
            return Err(NetError::NetworkUnavailable);
        }
        if !self.breaker.try_acquire() {
            debug!(url = %request.url, "circuit open, not attempting");
            return Err(NetError::CircuitOpen);
        }

        let executor = RetryExecutor::new(retry.clone());
        let result = executor
            .execute(cancel, |attempt| {
                let request = request.clone();
                async move {
                    // The breaker may have opened between attempts.
                    if attempt > 0 && !self.breaker.try_acquire() {
                        return Err(NetError::CircuitOpen);
                    }
                    debug!(method = request.method.as_str(), url = %request.url, attempt, "sending request");

                    let outcome = self
                        .client
                        .send(request)
                        .await
                        .and_then(HttpResponse::error_for_status);
                    match &outcome {
                        Ok(_) => self.breaker.record_success(),
                        Err(error) if error.counts_as_failure() => self.breaker.record_failure(),
                        Err(_) => {}
                    }
                    outcome
                }
            })
            .await;

        result.map_err(|err| {
            let err = NetError::from(err);
            if !matches!(err, NetError::Cancelled) {
                warn!(path = %endpoint.path, error = %err, "request failed");
            }
            err
        })
    }

    /// Executes `endpoint` and decodes the body with the configured decoder.
    ///
    /// Decode failures surface as [`NetError::Decoding`] and are never
    /// retried.
    pub async fn request_decoded<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> NetResult<T> {
        let body = self.request(endpoint, retry, cancel).await?;
        self.decoder.decode(&body)
    }

    /// Executes `endpoint` under the default retry policy and decodes the
    /// body.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> NetResult<T> {
        let retry = self.config.retry.clone();
        self.request_decoded(endpoint, &retry, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::config::BreakerConfig;
    use crate::http::ScriptedClient;
    use crate::reachability::ReachabilityFlag;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Health {
        ok: bool,
    }

    fn retry(attempts: u32) -> RetryConfig {
        RetryConfig::new(attempts)
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
    }

    fn client(breaker: BreakerConfig) -> ResilientHttpClient<ScriptedClient> {
        let config = NetConfig::new("https://api.example.com").with_breaker(breaker);
        ResilientHttpClient::new(config, ScriptedClient::new())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_server_errors_then_succeeds() {
        let client = client(BreakerConfig::default());
        client.transport().push_response(503, "busy");
        client.transport().push_error(NetError::Timeout);
        client.transport().push_response(200, r#"{"ok": true}"#);

        let health: Health = client
            .request_decoded(&Endpoint::get("/health"), &retry(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(health, Health { ok: true });
        assert_eq!(client.transport().request_count(), 3);
        assert_eq!(client.breaker().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let client = client(BreakerConfig::default());
        client.transport().push_response(404, "missing");

        let result = client
            .request(&Endpoint::get("/nope"), &retry(5), &CancellationToken::new())
            .await;

        assert_eq!(result, Err(NetError::status(404, "missing")));
        assert_eq!(client.transport().request_count(), 1);
        assert_eq!(client.breaker().failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_too_many_retries() {
        let client = client(BreakerConfig::default());
        client
            .transport()
            .set_fallback(Ok(HttpResponse::new(500, "boom")));

        let result = client
            .request(&Endpoint::get("/"), &retry(3), &CancellationToken::new())
            .await;

        match result {
            Err(NetError::TooManyRetries { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, NetError::status(500, "boom"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(client.transport().request_count(), 3);
    }

    #[tokio::test]
    async fn unreachable_network_fails_fast() {
        let flag = ReachabilityFlag::new(false);
        let client = client(BreakerConfig::default()).with_reachability(flag.clone());

        let result = client
            .request(&Endpoint::get("/"), &retry(3), &CancellationToken::new())
            .await;
        assert_eq!(result, Err(NetError::NetworkUnavailable));
        assert_eq!(client.transport().request_count(), 0);
        assert_eq!(client.breaker().failure_count(), 0);

        flag.set_reachable(true);
        client.transport().push_response(200, "{}");
        assert!(client
            .request(&Endpoint::get("/"), &retry(3), &CancellationToken::new())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_sending() {
        let client = client(BreakerConfig::default().with_failure_threshold(2));
        client
            .transport()
            .set_fallback(Ok(HttpResponse::new(502, "bad gateway")));

        let result = client
            .request(&Endpoint::get("/"), &retry(5), &CancellationToken::new())
            .await;
        // Two failures open the circuit; the third attempt is refused.
        assert_eq!(result, Err(NetError::CircuitOpen));
        assert_eq!(client.transport().request_count(), 2);
        assert_eq!(client.breaker().state(), CircuitState::Open);

        let result = client
            .request(&Endpoint::get("/"), &retry(5), &CancellationToken::new())
            .await;
        assert_eq!(result, Err(NetError::CircuitOpen));
        assert_eq!(client.transport().request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn decoding_failure_is_not_retried_or_counted() {
        let client = client(BreakerConfig::default());
        client.transport().push_response(200, "not json");

        let result: NetResult<Health> = client
            .request_decoded(&Endpoint::get("/health"), &retry(3), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(NetError::Decoding(_))));
        assert_eq!(client.transport().request_count(), 1);
        assert_eq!(client.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_request_does_not_trip_breaker() {
        let client = client(BreakerConfig::default().with_failure_threshold(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client.request(&Endpoint::get("/"), &retry(3), &cancel).await;
        assert_eq!(result, Err(NetError::Cancelled));
        assert_eq!(client.breaker().state(), CircuitState::Closed);
        assert_eq!(client.transport().request_count(), 0);
    }

    #[tokio::test]
    async fn shared_breaker_trips_all_clients() {
        let shared = Arc::new(CircuitBreaker::new(
            "rates",
            BreakerConfig::default().with_failure_threshold(1),
        ));
        let first = client(BreakerConfig::default()).with_breaker(Arc::clone(&shared));
        let second = client(BreakerConfig::default()).with_breaker(Arc::clone(&shared));

        first.transport().push_response(500, "boom");
        let _ = first
            .request(&Endpoint::get("/"), &RetryConfig::none(), &CancellationToken::new())
            .await;

        let result = second
            .request(&Endpoint::get("/"), &RetryConfig::none(), &CancellationToken::new())
            .await;
        assert_eq!(result, Err(NetError::CircuitOpen));
        assert_eq!(second.transport().request_count(), 0);
    }
}

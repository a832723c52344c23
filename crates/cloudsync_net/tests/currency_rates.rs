//! Typed fetches through the resilient client, the way the application
//! layer pulls exchange rates.

use chrono::{DateTime, TimeZone, Utc};
use cloudsync_net::{
    BreakerConfig, CancellationToken, CircuitState, Endpoint, NetConfig, NetError,
    ResilientHttpClient, RetryConfig, ScriptedClient,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RatesResponse {
    base: String,
    updated_at: DateTime<Utc>,
    rates: BTreeMap<String, f64>,
}

const RATES_BODY: &str = r#"{
    "base": "USD",
    "updated_at": "2024-05-02T08:00:00Z",
    "rates": {"EUR": 0.93, "GBP": 0.80, "JPY": 155.2}
}"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn rates_client() -> ResilientHttpClient<ScriptedClient> {
    let config = NetConfig::new("https://rates.example.com/api")
        .with_retry(
            RetryConfig::new(4)
                .with_base_delay(Duration::from_millis(200))
                .with_max_delay(Duration::from_secs(2)),
        )
        .with_breaker(
            BreakerConfig::default()
                .with_failure_threshold(3)
                .with_timeout(Duration::from_secs(30)),
        );
    ResilientHttpClient::new(config, ScriptedClient::new())
}

fn latest(base: &str) -> Endpoint {
    Endpoint::get("/latest").query("base", base)
}

#[tokio::test(start_paused = true)]
async fn fetches_rates_after_a_flaky_gateway() {
    init_tracing();
    let client = rates_client();
    client.transport().push_response(502, "bad gateway");
    client.transport().push_response(200, RATES_BODY);

    let rates: RatesResponse = client
        .fetch(&latest("USD"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(rates.base, "USD");
    assert_eq!(rates.updated_at, Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap());
    assert_eq!(rates.rates.len(), 3);
    assert!((rates.rates["EUR"] - 0.93).abs() < f64::EPSILON);

    let requests = client.transport().requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0].url.as_str(),
        "https://rates.example.com/api/latest?base=USD"
    );
}

#[tokio::test(start_paused = true)]
async fn outage_opens_the_circuit_and_recovery_closes_it() {
    init_tracing();
    let client = rates_client();
    let cancel = CancellationToken::new();
    client
        .transport()
        .set_fallback(Err(NetError::Transport("connection refused".into())));

    let result: Result<RatesResponse, _> = client.fetch(&latest("USD"), &cancel).await;
    assert_eq!(result.unwrap_err(), NetError::CircuitOpen);
    assert_eq!(client.breaker().state(), CircuitState::Open);
    let sent_during_outage = client.transport().request_count();
    assert_eq!(sent_during_outage, 3);

    // Cooldown elapses; the remote is healthy again.
    tokio::time::advance(Duration::from_secs(31)).await;
    client
        .transport()
        .set_fallback(Ok(cloudsync_net::HttpResponse::new(200, RATES_BODY)));

    let first: RatesResponse = client.fetch(&latest("USD"), &cancel).await.unwrap();
    assert_eq!(first.base, "USD");
    assert_eq!(client.breaker().state(), CircuitState::HalfOpen);

    let _: RatesResponse = client.fetch(&latest("EUR"), &cancel).await.unwrap();
    assert_eq!(client.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn schema_mismatch_is_reported_as_decoding() {
    init_tracing();
    let client = rates_client();
    client
        .transport()
        .push_response(200, r#"{"base": "USD", "rates": "unavailable"}"#);

    let result: Result<RatesResponse, _> =
        client.fetch(&latest("USD"), &CancellationToken::new()).await;

    assert!(matches!(result, Err(NetError::Decoding(_))));
    assert_eq!(client.transport().request_count(), 1);
}

//! # cloudsync net
//!
//! Failure-tolerant request execution for cloudsync.
//!
//! This crate provides:
//! - A mutex-guarded circuit breaker (closed → open → half-open)
//! - Bounded exponential-backoff retry with jitter and cancellation
//! - An HTTP transport abstraction with a `reqwest` implementation
//! - A resilient client composing reachability, breaker, retry and decoding
//!
//! ## Error taxonomy
//!
//! - Transient (retried, counted by the breaker): timeouts, 5xx, transport
//! - Fatal (surfaced at once): 4xx, decoding failures, invalid requests
//! - Fail-fast signals (never attempted, never counted): `NetworkUnavailable`,
//!   `CircuitOpen`, `Cancelled`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod breaker;
mod client;
mod config;
mod decode;
mod error;
mod http;
mod reachability;
mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use client::ResilientHttpClient;
pub use config::{BreakerConfig, NetConfig, RetryConfig};
pub use decode::{JsonDecoder, ResponseDecoder};
pub use error::{NetError, NetResult};
pub use http::{
    Endpoint, HttpClient, HttpMethod, HttpRequest, HttpResponse, ReqwestClient, ScriptedClient,
};
pub use reachability::{AlwaysReachable, Reachability, ReachabilityFlag};
pub use retry::{RetryError, RetryExecutor, Retryable};
pub use tokio_util::sync::CancellationToken;

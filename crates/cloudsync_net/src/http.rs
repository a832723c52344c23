//! HTTP transport abstraction.
//!
//! The actual HTTP stack sits behind [`HttpClient`] so the resilient layer
//! can be exercised without a network. [`ReqwestClient`] is the production
//! implementation; [`ScriptedClient`] replays canned outcomes for tests.

use crate::config::NetConfig;
use crate::error::{NetError, NetResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Url;
use std::collections::{BTreeMap, VecDeque};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

impl HttpMethod {
    /// Returns the method name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A logical API endpoint, independent of the host it is sent to.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// Path relative to the base URL (e.g. `/latest`).
    pub path: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Query parameters, emitted in key order.
    pub query_params: BTreeMap<String, String>,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Request body.
    pub body: Option<Bytes>,
}

impl Endpoint {
    /// Creates an endpoint with the given method and path.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            query_params: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Creates a GET endpoint.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    /// Creates a POST endpoint.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    /// Creates a PUT endpoint.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    /// Creates a DELETE endpoint.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    /// Adds a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets a JSON body and content type.
    pub fn json<T: serde::Serialize>(self, value: &T) -> NetResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| NetError::InvalidRequest(format!("failed to encode body: {}", e)))?;
        Ok(self.header("content-type", "application/json").body(body))
    }

    /// Resolves this endpoint against `base_url` into a concrete request.
    pub fn to_request(&self, base_url: &str) -> NetResult<HttpRequest> {
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base = Url::parse(&base)
            .map_err(|e| NetError::InvalidRequest(format!("invalid base url {}: {}", base_url, e)))?;
        let mut url = base
            .join(self.path.trim_start_matches('/'))
            .map_err(|e| NetError::InvalidRequest(format!("invalid path {}: {}", self.path, e)))?;

        if !self.query_params.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query_params.iter());
        }

        Ok(HttpRequest {
            method: self.method,
            url,
            headers: self.headers.clone(),
            body: self.body.clone(),
        })
    }
}

/// A fully-resolved HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Absolute URL including query string.
    pub url: Url,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Request body.
    pub body: Option<Bytes>,
}

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts a non-2xx response into a status error.
    pub fn error_for_status(self) -> NetResult<Bytes> {
        if self.is_success() {
            Ok(self.body)
        } else {
            let message = String::from_utf8_lossy(&self.body).into_owned();
            Err(NetError::status(self.status, message))
        }
    }
}

/// HTTP client abstraction.
///
/// Implementations perform exactly one exchange per call. Any response,
/// including 4xx and 5xx, is returned as `Ok`; only failures to obtain a
/// response are errors.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends the request and returns the raw response.
    async fn send(&self, request: HttpRequest) -> NetResult<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Builds a client with the timeouts and user agent from `config`.
    pub fn new(config: &NetConfig) -> NetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| NetError::InvalidRequest(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wraps an existing `reqwest` client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> NetResult<HttpResponse> {
        let mut builder = self.client.request(request.method.into(), request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(HttpResponse { status, body })
    }
}

/// [`HttpClient`] that replays a queue of canned outcomes.
///
/// Every request is recorded. When the queue runs dry the fallback outcome
/// (if any) is returned, otherwise a transport error.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    outcomes: Mutex<VecDeque<NetResult<HttpResponse>>>,
    fallback: Mutex<Option<NetResult<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedClient {
    /// Creates an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, status: u16, body: impl Into<Bytes>) {
        self.outcomes
            .lock()
            .push_back(Ok(HttpResponse::new(status, body)));
    }

    /// Queues a transport-level failure.
    pub fn push_error(&self, error: NetError) {
        self.outcomes.lock().push_back(Err(error));
    }

    /// Sets the outcome returned once the queue is empty.
    pub fn set_fallback(&self, outcome: NetResult<HttpResponse>) {
        *self.fallback.lock() = Some(outcome);
    }

    /// Returns all requests seen so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Returns the number of requests seen so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn send(&self, request: HttpRequest) -> NetResult<HttpResponse> {
        self.requests.lock().push(request);
        if let Some(outcome) = self.outcomes.lock().pop_front() {
            return outcome;
        }
        self.fallback
            .lock()
            .clone()
            .unwrap_or_else(|| Err(NetError::Transport("no scripted response".into())))
    }
}

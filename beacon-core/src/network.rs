//! HTTP client with connectivity interceptors
//!
//! Every request outcome is reported to the registered [`RequestInterceptor`]s
//! before the client decides whether to retry. Interceptors can defer a retry
//! until some condition holds (see [`RetryPolicy::When`]); otherwise transient
//! failures are retried with exponential backoff.
//!
//! Delivery outcome and connectivity signal are kept apart: a non-2xx response
//! is an error for the caller but still proves the network is reachable.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::reactive::StateStream;
use crate::timing::{Backoff, ExponentialBackoff};

/// Why a request did not produce a 2xx response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The request never reached the server (offline, refused, timed out)
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The server answered with a non-success status
    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },

    /// The request was abandoned before completing
    #[error("request cancelled")]
    Cancelled,

    /// Anything else (invalid request, body encoding)
    #[error("request failed: {0}")]
    Other(String),
}

impl NetworkError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Connectivity(_) => true,
            NetworkError::Status { status, .. } => *status >= 500 || *status == 429,
            NetworkError::Cancelled | NetworkError::Other(_) => false,
        }
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        // is_request covers connections dropped while the request was in flight
        if error.is_connect() || error.is_timeout() || error.is_request() {
            NetworkError::Connectivity(error.to_string())
        } else {
            NetworkError::Other(error.to_string())
        }
    }
}

impl From<NetworkError> for Error {
    fn from(error: NetworkError) -> Self {
        Error::Network(error.to_string())
    }
}

/// Result of one request attempt: the 2xx status, or why there was none.
pub type RequestResult = std::result::Result<u16, NetworkError>;

/// What to do after a failed attempt.
pub enum RetryPolicy {
    DoNotRetry,
    /// Retry once the delay has elapsed
    AfterDelay(Duration),
    /// Retry as soon as the stream reports `true`
    When(StateStream<bool>),
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::DoNotRetry => write!(f, "DoNotRetry"),
            RetryPolicy::AfterDelay(delay) => write!(f, "AfterDelay({:?})", delay),
            RetryPolicy::When(stream) => write!(f, "When(current = {})", stream.current()),
        }
    }
}

/// Hooks observing requests made by a [`NetworkClient`].
pub trait RequestInterceptor: Send + Sync {
    /// A request is stalled waiting for connectivity.
    fn on_waiting(&self) {}

    /// A request attempt finished.
    fn on_completion(&self, _result: &RequestResult) {}

    /// Decide how to retry `error`. `deferred` counts the [`RetryPolicy::When`]
    /// waits this request has already been through. The first interceptor
    /// that does not answer [`RetryPolicy::DoNotRetry`] wins.
    fn retry_policy(&self, _error: &NetworkError, _deferred: usize) -> RetryPolicy {
        RetryPolicy::DoNotRetry
    }
}

/// JSON-over-HTTP client shared by dispatchers.
pub struct NetworkClient {
    http_client: reqwest::Client,
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
    max_retries: usize,
    backoff: ExponentialBackoff,
}

impl NetworkClient {
    pub fn new(timeout: Duration, max_retries: usize) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            interceptors: Vec::new(),
            max_retries,
            backoff: ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(30)),
        })
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// POST `body` as JSON, retrying per the interceptors and backoff.
    ///
    /// Delayed retries are bounded by `max_retries`. Waits for connectivity
    /// are bounded by the interceptor that asks for them.
    pub async fn post_json<T>(&self, url: &str, body: &T) -> RequestResult
    where
        T: Serialize + ?Sized,
    {
        let mut delayed = 0;
        let mut deferred = 0;
        loop {
            let result = self.send_once(url, body).await;
            for interceptor in &self.interceptors {
                interceptor.on_completion(&result);
            }

            let error = match result {
                Ok(status) => return Ok(status),
                Err(error) => error,
            };

            match self.retry_policy(&error, delayed + 1, deferred) {
                RetryPolicy::DoNotRetry => return Err(error),
                RetryPolicy::AfterDelay(_) if delayed >= self.max_retries => return Err(error),
                RetryPolicy::AfterDelay(delay) => {
                    delayed += 1;
                    tracing::debug!(
                        url,
                        attempt = delayed,
                        max_retries = self.max_retries,
                        ?delay,
                        error = %error,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryPolicy::When(mut condition) => {
                    deferred += 1;
                    tracing::debug!(url, deferred, error = %error, "Deferring retry until reachable");
                    if condition.wait_for(|ready| *ready).await.is_none() {
                        return Err(error);
                    }
                }
            }
        }
    }

    fn retry_policy(&self, error: &NetworkError, attempt: usize, deferred: usize) -> RetryPolicy {
        for interceptor in &self.interceptors {
            match interceptor.retry_policy(error, deferred) {
                RetryPolicy::DoNotRetry => continue,
                policy => return policy,
            }
        }

        if error.is_retryable() {
            let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
            RetryPolicy::AfterDelay(self.backoff.delay(attempt))
        } else {
            RetryPolicy::DoNotRetry
        }
    }

    async fn send_once<T>(&self, url: &str, body: &T) -> RequestResult
    where
        T: Serialize + ?Sized,
    {
        let response = self
            .http_client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(NetworkError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(NetworkError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

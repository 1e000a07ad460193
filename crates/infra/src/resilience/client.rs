//! Resilient HTTP client: bounded retries with backoff, behind a circuit breaker.
//!
//! One call to [`ResilientClient::execute`] is one *logical* call as far as
//! the breaker is concerned: permission is asked once up front, and the
//! outcome is reported once at the end. A call that succeeds on a retry
//! records a success; a call that exhausts its retries records exactly one
//! failure.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitOpenError, DEFAULT_MAX_FAILURES, DEFAULT_OPEN_TIMEOUT};
use super::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Fast-fail: the breaker refused the call. Nothing was sent.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Network/IO failure on the final attempt.
    #[error("transport error after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// Server error status (>= 500) on the final attempt.
    #[error("remote returned {status} after {attempts} attempt(s)")]
    RemoteStatus { attempts: u32, status: StatusCode },

    /// The request could not be built; not retried.
    #[error("invalid request: {0}")]
    Request(#[source] reqwest::Error),

    /// The caller's cancellation token fired.
    #[error("request cancelled")]
    Cancelled,

    #[error("failed to build http client: {0}")]
    Setup(#[source] reqwest::Error),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Overall timeout of a single attempt (connect + response).
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_failures: u32,
    pub open_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            max_failures: DEFAULT_MAX_FAILURES,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

enum AttemptFailure {
    Transport(reqwest::Error),
    Status(StatusCode),
}

impl core::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AttemptFailure::Transport(e) => write!(f, "{e}"),
            AttemptFailure::Status(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResilientClient {
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl ResilientClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ClientError::Setup)?;

        Ok(Self {
            http,
            breaker: Arc::new(CircuitBreaker::new(config.max_failures, config.open_timeout)),
            retry: config.retry,
        })
    }

    /// Share an existing breaker (one breaker per remote dependency).
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// GET `url` with the retry/breaker policy.
    pub async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<Response, ClientError> {
        self.execute(|http| http.get(url), cancel).await
    }

    /// Execute one logical call. `build` is invoked once per attempt, so a
    /// request body is never reused across attempts.
    ///
    /// Any response with status < 500 is returned as-is (4xx included);
    /// transport errors and 5xx are retried.
    pub async fn execute<F>(
        &self,
        build: F,
        cancel: &CancellationToken,
    ) -> Result<Response, ClientError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let permit = self.breaker.check_before_call().map_err(|e| {
            error!(error = %e, "request blocked by circuit breaker");
            ClientError::from(e)
        })?;

        let mut attempt: u32 = 0;
        let failure = loop {
            let request = build(&self.http).build().map_err(ClientError::Request)?;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                res = self.http.execute(request) => res,
            };

            let failure = match outcome {
                Ok(response) if response.status().as_u16() < 500 => {
                    permit.success();
                    return Ok(response);
                }
                Ok(response) => AttemptFailure::Status(response.status()),
                Err(e) => AttemptFailure::Transport(e),
            };

            if !self.retry.should_retry(attempt) {
                break failure;
            }

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                attempt = attempt + 1,
                sleep_ms = delay.as_millis() as u64,
                error = %failure,
                "request failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        };

        permit.failure();

        let attempts = attempt + 1;
        Err(match failure {
            AttemptFailure::Transport(source) => ClientError::Transport { attempts, source },
            AttemptFailure::Status(status) => ClientError::RemoteStatus { attempts, status },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use crate::test_support::{StatusScript, closed_port_url};
    use std::time::Instant;

    fn fast_config(max_retries: u32) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::exponential(max_retries, Duration::from_millis(1)),
            max_failures: 5,
            open_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn retries_until_success_without_recording_failure() {
        let stub = StatusScript::spawn(vec![500, 503, 200]).await;
        let client = ResilientClient::new(fast_config(3)).unwrap();

        let resp = client
            .get(&stub.url("/rates/USD"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(stub.calls(), 3);
        assert_eq!(client.breaker().failure_count(), 0);
        assert_eq!(client.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn always_500_exhausts_budget_and_records_one_failure() {
        let stub = StatusScript::spawn(vec![500]).await;
        let client = ResilientClient::new(fast_config(3)).unwrap();

        let err = client
            .get(&stub.url("/rates/USD"), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ClientError::RemoteStatus { attempts, status } => {
                assert_eq!(attempts, 4);
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(stub.calls(), 4);
        assert_eq!(client.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let stub = StatusScript::spawn(vec![404]).await;
        let client = ResilientClient::new(fast_config(3)).unwrap();

        let resp = client
            .get(&stub.url("/rates/XXX"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(stub.calls(), 1);
        assert_eq!(client.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn transport_errors_are_reported_as_transport() {
        let url = closed_port_url().await;
        let client = ResilientClient::new(fast_config(1)).unwrap();

        let err = client.get(&url, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ClientError::Transport { attempts: 2, .. }));
        assert_eq!(client.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_sending() {
        let stub = StatusScript::spawn(vec![200]).await;
        let client = ResilientClient::new(fast_config(3)).unwrap();
        for _ in 0..5 {
            client.breaker().on_failure();
        }

        let err = client
            .get(&stub.url("/rates/USD"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::CircuitOpen(_)));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let stub = StatusScript::spawn(vec![500]).await;
        let config = ClientConfig {
            retry: RetryPolicy::exponential(3, Duration::from_secs(30)),
            ..fast_config(3)
        };
        let client = ResilientClient::new(config).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = client.get(&stub.url("/rates/USD"), &cancel).await.unwrap_err();

        assert!(matches!(err, ClientError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stub.calls(), 1);
        assert_eq!(client.breaker().failure_count(), 0);
    }
}

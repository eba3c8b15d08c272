//! Bounded retries with exponential backoff for hub and runtime requests.
//!
//! Transport failures and transient statuses (408, 429, 5xx) are retried;
//! anything else is handed back to the caller on the first attempt. A
//! `Retry-After` of less than a minute overrides the computed backoff.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};

const MAX_HONORED_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction by which a delay may be shortened at random.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

/// Result of [`RetryConfig::send`].
#[derive(Debug)]
pub enum RetryOutcome {
    Success(Response),
    /// Final non-2xx response: either not transient or out of retries.
    HttpError(Response),
    ConnectionError {
        attempts: u32,
        source: reqwest::Error,
    },
}

impl RetryConfig {
    /// Wait before the retry that follows failed attempt `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32, headers: Option<&HeaderMap>) -> Duration {
        if let Some(delay) = headers.and_then(retry_after) {
            return delay;
        }
        let nominal = self
            .initial_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay);
        let shrink = rand::random::<f64>() * self.jitter_factor.clamp(0.0, 1.0);
        nominal.mul_f64(1.0 - shrink)
    }

    /// Send the request built by `build`, rebuilding it for every attempt.
    pub async fn send<F>(&self, build: F) -> RetryOutcome
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let exhausted = attempt >= self.max_retries;
            let delay = match build().send().await {
                Ok(response) if response.status().is_success() => {
                    return RetryOutcome::Success(response);
                }
                Ok(response) => {
                    let status = response.status();
                    if exhausted || !is_retryable_status(status) {
                        return RetryOutcome::HttpError(response);
                    }
                    tracing::debug!(%status, attempt, "Transient status, retrying");
                    self.delay_for(attempt, Some(response.headers()))
                }
                Err(source) => {
                    if exhausted || !is_transient(&source) {
                        return RetryOutcome::ConnectionError {
                            attempts: attempt + 1,
                            source,
                        };
                    }
                    tracing::debug!(error = %source, attempt, "Transport error, retrying");
                    self.delay_for(attempt, None)
                }
            };
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    let delay = Duration::from_secs(secs);
    (!delay.is_zero() && delay < MAX_HONORED_RETRY_AFTER).then_some(delay)
}

fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry_config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn retry_after_must_be_in_range() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("5"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(5)));

        headers.insert("retry-after", HeaderValue::from_static("120"));
        assert_eq!(retry_after(&headers), None);

        headers.insert("retry-after", HeaderValue::from_static("0"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn auth_and_missing_are_not_retried() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for(0, None), Duration::from_millis(500));
        assert_eq!(config.delay_for(1, None), Duration::from_secs(1));
        assert_eq!(config.delay_for(10, None), Duration::from_secs(8));
    }

    #[test]
    fn jitter_only_shortens() {
        let config = RetryConfig::default();
        for _ in 0..50 {
            let delay = config.delay_for(0, None);
            assert!(delay >= Duration::from_millis(375));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        let attempt = AtomicU32::new(0);
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(move |_: &wiremock::Request| {
                if attempt.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(503)
                } else {
                    ResponseTemplate::new(200).set_body_string("ok")
                }
            })
            .expect(2)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/file", server.uri());
        let outcome = fast_retry_config().send(|| client.get(&url)).await;
        assert!(matches!(outcome, RetryOutcome::Success(_)));
    }

    #[tokio::test]
    async fn unauthorized_is_returned_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gated"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/gated", server.uri());
        match fast_retry_config().send(|| client.get(&url)).await {
            RetryOutcome::HttpError(response) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            }
            other => panic!("expected HttpError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/flaky", server.uri());
        match fast_retry_config().send(|| client.get(&url)).await {
            RetryOutcome::HttpError(response) => {
                assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            }
            other => panic!("expected HttpError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_a_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let client = reqwest::Client::new();
        let outcome = fast_retry_config().send(|| client.get(&url)).await;
        match outcome {
            RetryOutcome::ConnectionError { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected ConnectionError, got {other:?}"),
        }
    }
}

//! Client for the remote HTTP state backend.
//!
//! The proxy talks to the backend through the [`BackendClient`] trait so
//! handlers can be tested against an in-memory fake. [`HttpBackend`] is the
//! `reqwest` implementation with an optional retry loop: connection errors,
//! `429` and `5xx` responses are retried with a doubling backoff. When
//! retries run out on an error status, the last response is returned so the
//! caller can relay it.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use tracing::warn;

/// A request to forward to the backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The backend's answer.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Errors talking to the backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("could not build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("backend request to {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

/// Sends requests to the state backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError>;
}

/// Retry settings for [`HttpBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero sends each request once.
    pub retry_max: u32,
    pub wait_min: Duration,
    pub wait_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_max: 0,
            wait_min: Duration::from_secs(20),
            wait_max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `wait_min * 2^attempt`,
    /// capped at `wait_max`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.wait_min.saturating_mul(factor).min(self.wait_max)
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

/// `reqwest`-backed [`BackendClient`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpBackend {
    /// Build a client with the given retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Client`] if the TLS stack cannot be set up.
    pub fn new(policy: RetryPolicy) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stateseal/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(BackendError::Client)?;
        Ok(Self { client, policy })
    }
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .request(request.method.clone(), &request.url)
                .headers(request.headers.clone())
                .body(request.body.clone())
                .send()
                .await;

            let retries_left = attempt < self.policy.retry_max;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if retries_left && is_retryable(status) {
                        let wait = self.policy.backoff(attempt);
                        warn!(
                            url = %request.url,
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            wait_secs = wait.as_secs(),
                            "backend returned retryable status, retrying"
                        );
                        attempt += 1;
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    let headers = resp.headers().clone();
                    let body = resp.bytes().await.map_err(|source| BackendError::Transport {
                        url: request.url.clone(),
                        attempts: attempt + 1,
                        source,
                    })?;
                    return Ok(BackendResponse {
                        status,
                        headers,
                        body,
                    });
                }
                Err(e) if retries_left => {
                    let wait = self.policy.backoff(attempt);
                    warn!(
                        url = %request.url,
                        error = %e,
                        attempt = attempt + 1,
                        wait_secs = wait.as_secs(),
                        "backend request failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(wait).await;
                }
                Err(source) => {
                    return Err(BackendError::Transport {
                        url: request.url.clone(),
                        attempts: attempt + 1,
                        source,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::http::HeaderValue;
    use tokio::net::TcpListener;

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn fast_policy(retry_max: u32) -> RetryPolicy {
        RetryPolicy {
            retry_max,
            wait_min: Duration::from_millis(1),
            wait_max: Duration::from_millis(5),
        }
    }

    fn get(url: String) -> BackendRequest {
        BackendRequest {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Fails with 503 until `failures` requests have been seen.
    async fn flaky(
        State((hits, failures)): State<(Arc<AtomicUsize>, usize)>,
    ) -> (StatusCode, &'static str) {
        let n = hits.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            (StatusCode::SERVICE_UNAVAILABLE, "busy")
        } else {
            (StatusCode::OK, "ready")
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(20));
        assert_eq!(policy.backoff(1), Duration::from_secs(40));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::NOT_IMPLEMENTED));
        assert!(!is_retryable(StatusCode::CONFLICT));
        assert!(!is_retryable(StatusCode::OK));
    }

    #[tokio::test]
    async fn forwards_method_headers_and_body() {
        let app = Router::new().fallback(
            |method: Method, headers: HeaderMap, body: Bytes| async move {
                let tag = headers
                    .get("x-tag")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_owned();
                (
                    StatusCode::CREATED,
                    [("x-echo", format!("{method} {tag}"))],
                    body,
                )
            },
        );
        let base = serve(app).await;
        let backend = HttpBackend::new(RetryPolicy::default()).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-tag", HeaderValue::from_static("t1"));
        let resp = backend
            .send(BackendRequest {
                method: Method::from_bytes(b"LOCK").unwrap(),
                url: format!("{base}/state"),
                headers,
                body: Bytes::from_static(b"payload"),
            })
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::CREATED);
        assert_eq!(resp.headers["x-echo"], "LOCK t1");
        assert_eq!(resp.body, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn single_attempt_relays_error_status() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .fallback(flaky)
            .with_state((hits.clone(), usize::MAX));
        let base = serve(app).await;
        let backend = HttpBackend::new(fast_policy(0)).unwrap();

        let resp = backend.send(get(base)).await.unwrap();
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.body, Bytes::from_static(b"busy"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().fallback(flaky).with_state((hits.clone(), 2));
        let base = serve(app).await;
        let backend = HttpBackend::new(fast_policy(3)).unwrap();

        let resp = backend.send(get(base)).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connection_error_after_retries() {
        let backend = HttpBackend::new(fast_policy(1)).unwrap();
        let result = backend.send(get("http://127.0.0.1:1/state".to_owned())).await;
        assert!(matches!(
            result,
            Err(BackendError::Transport { attempts: 2, .. })
        ));
    }
}

//! Credential lease cache for the transit provider.
//!
//! The remote key service hands out tokens with a lease duration. The cache
//! keeps the current token and only logs in again once the lease, minus a
//! safety margin, has run out. A failed login yields an empty token so the
//! calling operation fails with a service error instead of the cache
//! surfacing its own error type.
//!
//! Refreshes are single-flight: callers that find the lease expired queue on
//! a refresh lock, and only the first of them logs in. Callers holding a
//! valid lease never wait on it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::KeyProviderError;

/// Result of a successful login against the key service.
#[derive(Clone)]
pub struct LoginResponse {
    pub client_token: String,
    pub lease_duration: Duration,
}

impl fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginResponse")
            .field("client_token", &"[REDACTED]")
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

/// Something that can obtain a fresh token from the key service.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Log in and return a token with its lease duration.
    async fn login(&self) -> Result<LoginResponse, KeyProviderError>;
}

struct Lease {
    token: String,
    valid_until: Instant,
}

/// Caches a single service token and refreshes it near expiry.
pub struct LeaseCache {
    authenticator: Arc<dyn Authenticator>,
    margin: Duration,
    current: RwLock<Option<Lease>>,
    refresh: Mutex<()>,
}

impl LeaseCache {
    /// Create an empty cache. The first [`get_token`](Self::get_token) logs in.
    #[must_use]
    pub fn new(authenticator: Arc<dyn Authenticator>, margin: Duration) -> Self {
        Self {
            authenticator,
            margin,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Return a token that is valid for at least the configured margin.
    ///
    /// Returns an empty string if a login was needed and failed.
    pub async fn get_token(&self) -> String {
        if let Some(token) = self.valid_token().await {
            return token;
        }

        let _refresh = self.refresh.lock().await;
        // Another caller may have refreshed while this one waited.
        if let Some(token) = self.valid_token().await {
            return token;
        }

        let login = match self.authenticator.login().await {
            Ok(login) => login,
            Err(e) => {
                warn!(error = %e, "key service login failed");
                return String::new();
            }
        };

        let usable = login.lease_duration.saturating_sub(self.margin);
        debug!(
            lease_secs = login.lease_duration.as_secs(),
            usable_secs = usable.as_secs(),
            "obtained key service token"
        );

        let token = login.client_token;
        *self.current.write().await = Some(Lease {
            token: token.clone(),
            valid_until: Instant::now() + usable,
        });
        token
    }

    async fn valid_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|lease| Instant::now() < lease.valid_until)
            .map(|lease| lease.token.clone())
    }
}

impl fmt::Debug for LeaseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCache")
            .field("margin", &self.margin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingAuthenticator {
        logins: AtomicUsize,
        lease: Duration,
        latency: Duration,
        fail: bool,
    }

    impl CountingAuthenticator {
        fn new(lease: Duration) -> Arc<Self> {
            Arc::new(Self {
                logins: AtomicUsize::new(0),
                lease,
                latency: Duration::ZERO,
                fail: false,
            })
        }

        fn slow(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                logins: AtomicUsize::new(0),
                lease: Duration::from_secs(3600),
                latency,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                logins: AtomicUsize::new(0),
                lease: Duration::from_secs(3600),
                latency: Duration::ZERO,
                fail: true,
            })
        }

        fn logins(&self) -> usize {
            self.logins.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn login(&self) -> Result<LoginResponse, KeyProviderError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.latency).await;
            if self.fail {
                return Err(KeyProviderError::ServiceUnavailable {
                    reason: "connection refused".to_owned(),
                });
            }
            Ok(LoginResponse {
                client_token: format!("token-{n}"),
                lease_duration: self.lease,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_token_within_lease() {
        let auth = CountingAuthenticator::new(Duration::from_secs(3600));
        let cache = LeaseCache::new(auth.clone(), Duration::from_secs(60));

        assert_eq!(cache.get_token().await, "token-1");
        tokio::time::advance(Duration::from_secs(3000)).await;
        assert_eq!(cache.get_token().await, "token-1");
        assert_eq!(auth.logins(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_after_lease_minus_margin() {
        let auth = CountingAuthenticator::new(Duration::from_secs(3600));
        let cache = LeaseCache::new(auth.clone(), Duration::from_secs(60));

        assert_eq!(cache.get_token().await, "token-1");
        tokio::time::advance(Duration::from_secs(3539)).await;
        assert_eq!(cache.get_token().await, "token-1");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get_token().await, "token-2");
        assert_eq!(auth.logins(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_shorter_than_margin_logs_in_every_time() {
        let auth = CountingAuthenticator::new(Duration::from_secs(30));
        let cache = LeaseCache::new(auth.clone(), Duration::from_secs(60));

        assert_eq!(cache.get_token().await, "token-1");
        assert_eq!(cache.get_token().await, "token-2");
        assert_eq!(auth.logins(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_login() {
        let auth = CountingAuthenticator::slow(Duration::from_millis(500));
        let cache = LeaseCache::new(auth.clone(), Duration::from_secs(60));

        let (a, b, c, d) = tokio::join!(
            cache.get_token(),
            cache.get_token(),
            cache.get_token(),
            cache.get_token()
        );
        assert_eq!([a, b, c, d], ["token-1"; 4].map(str::to_owned));
        assert_eq!(auth.logins(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refresh_after_expiry_logs_in_once() {
        let auth = CountingAuthenticator::slow(Duration::from_millis(500));
        let cache = Arc::new(LeaseCache::new(auth.clone(), Duration::from_secs(60)));
        assert_eq!(cache.get_token().await, "token-1");

        tokio::time::advance(Duration::from_secs(3600)).await;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_token().await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "token-2");
        }
        assert_eq!(auth.logins(), 2);
    }

    #[tokio::test]
    async fn failed_login_returns_empty_token_and_retries() {
        let auth = CountingAuthenticator::failing();
        let cache = LeaseCache::new(auth.clone(), Duration::from_secs(60));

        assert_eq!(cache.get_token().await, "");
        assert_eq!(cache.get_token().await, "");
        assert_eq!(auth.logins(), 2);
    }

    #[test]
    fn login_response_debug_redacts_token() {
        let login = LoginResponse {
            client_token: "hvs.super-secret".to_owned(),
            lease_duration: Duration::from_secs(10),
        };
        assert!(!format!("{login:?}").contains("super-secret"));
    }
}

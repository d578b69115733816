//! Transit key provider backed by a remote key service's HTTP API.
//!
//! Wrapping sends the base64 data key to `POST /v1/{mount}/encrypt/{key}` and
//! stores the returned ciphertext together with the service address, mount
//! path and key name. Unwrapping sends the stored ciphertext to the address,
//! mount and key recorded in the entry, so an envelope stays readable after
//! the configured key name changes.
//!
//! Authentication is `AppRole`: tokens come from
//! `POST /v1/auth/approle/login` and are cached by a [`LeaseCache`].
//!
//! Every call is retried on connection errors, `429` and `5xx` (except
//! `501`) up to `retry_max` times with a doubling backoff.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TransitConfig;
use crate::crypto::EncryptionKey;
use crate::error::KeyProviderError;
use crate::lease::{Authenticator, LeaseCache, LoginResponse};
use crate::provider::{KeyProvider, ProviderKind, WrappedKey};

/// Timeout applied to every call to the key service.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const TOKEN_HEADER: &str = "X-Vault-Token";

/// A data key wrapped by the remote transit engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitKeyEntry {
    pub vault_address: String,
    pub engine_path: String,
    pub key_name: String,
    /// RFC 3339 time the entry was created.
    pub created_at: String,
    /// Ciphertext returned by the transit engine.
    pub enc: String,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct EncryptData {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptData {
    plaintext: String,
}

#[derive(Deserialize)]
struct LoginEnvelope {
    auth: AuthData,
}

#[derive(Deserialize)]
struct AuthData {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// A failed attempt and whether another attempt may succeed.
struct Failure {
    error: KeyProviderError,
    retryable: bool,
}

impl Failure {
    fn transient(reason: String) -> Self {
        Self {
            error: KeyProviderError::ServiceUnavailable { reason },
            retryable: true,
        }
    }
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != reqwest::StatusCode::NOT_IMPLEMENTED)
}

/// HTTP client for the key service's transit and `AppRole` endpoints.
pub struct TransitClient {
    http: reqwest::Client,
    address: String,
    role_id: String,
    secret_id: String,
    retry_max: u32,
    retry_wait_min: Duration,
    retry_wait_max: Duration,
}

impl TransitClient {
    /// Build a client for the service at `config.address`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyProviderError::ServiceUnavailable`] if the HTTP client
    /// cannot be constructed.
    pub fn new(config: &TransitConfig) -> Result<Self, KeyProviderError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("stateseal/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KeyProviderError::ServiceUnavailable {
                reason: format!("could not build http client: {e}"),
            })?;
        Ok(Self {
            http,
            address: config.address.clone(),
            role_id: config.role_id.clone(),
            secret_id: config.secret_id.clone(),
            retry_max: config.retry_max,
            retry_wait_min: config.retry_wait_min,
            retry_wait_max: config.retry_wait_max,
        })
    }

    /// Encrypt `plaintext` with the named transit key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyProviderError::ServiceUnavailable`] on transport errors or
    /// non-success responses.
    pub async fn encrypt(
        &self,
        token: &str,
        address: &str,
        mount: &str,
        key_name: &str,
        plaintext: &[u8],
    ) -> Result<String, KeyProviderError> {
        let url = transit_url(address, mount, "encrypt", key_name);
        let body = serde_json::json!({ "plaintext": BASE64.encode(plaintext) });
        let resp: DataEnvelope<EncryptData> = self.post(&url, Some(token), &body).await?;
        Ok(resp.data.ciphertext)
    }

    /// Decrypt a transit `ciphertext` with the named key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyProviderError::ServiceUnavailable`] on transport errors or
    /// non-success responses, and [`KeyProviderError::InvalidResponse`] if the
    /// returned plaintext is not base64.
    pub async fn decrypt(
        &self,
        token: &str,
        address: &str,
        mount: &str,
        key_name: &str,
        ciphertext: &str,
    ) -> Result<Vec<u8>, KeyProviderError> {
        let url = transit_url(address, mount, "decrypt", key_name);
        let body = serde_json::json!({ "ciphertext": ciphertext });
        let resp: DataEnvelope<DecryptData> = self.post(&url, Some(token), &body).await?;
        BASE64
            .decode(resp.data.plaintext)
            .map_err(|e| KeyProviderError::InvalidResponse {
                reason: format!("plaintext is not valid base64: {e}"),
            })
    }

    /// Delay before retry number `attempt` (0-based): `retry_wait_min * 2^attempt`,
    /// capped at `retry_wait_max`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_wait_min
            .saturating_mul(factor)
            .min(self.retry_wait_max)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<T, KeyProviderError> {
        let mut attempt = 0;
        loop {
            match self.post_once(url, token, body).await {
                Ok(value) => return Ok(value),
                Err(failure) if failure.retryable && attempt < self.retry_max => {
                    let wait = self.backoff(attempt);
                    warn!(
                        url,
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis(),
                        error = %failure.error,
                        "key service request failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(wait).await;
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }

    async fn post_once<T: DeserializeOwned>(
        &self,
        url: &str,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<T, Failure> {
        let mut req = self.http.post(url).json(body);
        if let Some(token) = token {
            req = req.header(TOKEN_HEADER, token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Failure::transient(format!("request to {url} failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Failure::transient(format!("reading response from {url} failed: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .filter(|b| !b.errors.is_empty())
                .map_or_else(|| format!("HTTP {}", status.as_u16()), |b| b.errors.join(", "));
            return Err(Failure {
                error: KeyProviderError::ServiceUnavailable {
                    reason: format!("{url} returned {}: {message}", status.as_u16()),
                },
                retryable: is_retryable(status),
            });
        }

        serde_json::from_str(&text).map_err(|e| Failure {
            error: KeyProviderError::InvalidResponse {
                reason: format!("unexpected response from {url}: {e}"),
            },
            retryable: false,
        })
    }
}

#[async_trait]
impl Authenticator for TransitClient {
    async fn login(&self) -> Result<LoginResponse, KeyProviderError> {
        let url = format!("{}/v1/auth/approle/login", self.address.trim_end_matches('/'));
        let body = serde_json::json!({
            "role_id": self.role_id,
            "secret_id": self.secret_id,
        });
        let resp: LoginEnvelope = self.post(&url, None, &body).await?;
        Ok(LoginResponse {
            client_token: resp.auth.client_token,
            lease_duration: Duration::from_secs(resp.auth.lease_duration),
        })
    }
}

impl fmt::Debug for TransitClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitClient")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn transit_url(address: &str, mount: &str, operation: &str, key_name: &str) -> String {
    format!(
        "{}/v1/{}/{operation}/{key_name}",
        address.trim_end_matches('/'),
        mount.trim_matches('/')
    )
}

/// The transit provider: a client, its token cache, and the key used for
/// new envelopes.
#[derive(Debug)]
pub struct TransitProvider {
    client: Arc<TransitClient>,
    leases: Arc<LeaseCache>,
    address: String,
    mount: String,
    key_name: String,
}

impl TransitProvider {
    /// Build a provider with its own client and lease cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &TransitConfig) -> Result<Self, KeyProviderError> {
        let client = Arc::new(TransitClient::new(config)?);
        let leases = Arc::new(LeaseCache::new(client.clone(), config.token_margin));
        Ok(Self::new(client, leases, config))
    }

    /// Build a provider around an existing client and lease cache.
    #[must_use]
    pub fn new(client: Arc<TransitClient>, leases: Arc<LeaseCache>, config: &TransitConfig) -> Self {
        Self {
            client,
            leases,
            address: config.address.clone(),
            mount: config.mount.clone(),
            key_name: config.key_name.clone(),
        }
    }

    async fn token(&self) -> Result<String, KeyProviderError> {
        let token = self.leases.get_token().await;
        if token.is_empty() {
            return Err(KeyProviderError::ServiceUnavailable {
                reason: "no key service token available".to_owned(),
            });
        }
        Ok(token)
    }
}

#[async_trait]
impl KeyProvider for TransitProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Transit
    }

    async fn wrap(&self, data_key: &EncryptionKey) -> Result<WrappedKey, KeyProviderError> {
        let token = self.token().await?;
        let enc = self
            .client
            .encrypt(
                &token,
                &self.address,
                &self.mount,
                &self.key_name,
                data_key.as_bytes(),
            )
            .await?;
        debug!(key_name = %self.key_name, "wrapped data key with transit");
        Ok(WrappedKey::Transit(TransitKeyEntry {
            vault_address: self.address.clone(),
            engine_path: self.mount.clone(),
            key_name: self.key_name.clone(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            enc,
        }))
    }

    async fn unwrap(&self, wrapped: &WrappedKey) -> Result<EncryptionKey, KeyProviderError> {
        let WrappedKey::Transit(entry) = wrapped else {
            return Err(KeyProviderError::WrongEntry {
                provider: ProviderKind::Transit.name(),
                entry: wrapped.kind().name(),
            });
        };
        let token = self.token().await?;
        let plain = self
            .client
            .decrypt(
                &token,
                &entry.vault_address,
                &entry.engine_path,
                &entry.key_name,
                &entry.enc,
            )
            .await?;
        Ok(EncryptionKey::from_slice(&plain)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::FakeVault;

    #[tokio::test]
    async fn wrap_unwrap_through_fake_service() {
        let vault = FakeVault::start().await;
        let provider = TransitProvider::from_config(&vault.config("state")).unwrap();
        let data_key = EncryptionKey::generate();

        let wrapped = provider.wrap(&data_key).await.unwrap();
        let WrappedKey::Transit(entry) = &wrapped else {
            unreachable!("transit provider produced a non-transit entry");
        };
        assert_eq!(entry.vault_address, vault.address);
        assert_eq!(entry.engine_path, "transit");
        assert_eq!(entry.key_name, "state");
        assert!(entry.enc.starts_with("vault:v1:"));

        let recovered = provider.unwrap(&wrapped).await.unwrap();
        assert_eq!(recovered.as_bytes(), data_key.as_bytes());
    }

    #[tokio::test]
    async fn token_is_reused_across_calls() {
        let vault = FakeVault::start().await;
        let provider = TransitProvider::from_config(&vault.config("state")).unwrap();

        let wrapped = provider.wrap(&EncryptionKey::generate()).await.unwrap();
        provider.unwrap(&wrapped).await.unwrap();
        provider.wrap(&EncryptionKey::generate()).await.unwrap();
        assert_eq!(vault.login_count(), 1);
    }

    #[tokio::test]
    async fn unwrap_uses_stored_key_name() {
        let vault = FakeVault::start().await;
        let old = TransitProvider::from_config(&vault.config("old-key")).unwrap();
        let new = TransitProvider::from_config(&vault.config("new-key")).unwrap();

        let data_key = EncryptionKey::generate();
        let wrapped = old.wrap(&data_key).await.unwrap();
        let recovered = new.unwrap(&wrapped).await.unwrap();
        assert_eq!(recovered.as_bytes(), data_key.as_bytes());
    }

    #[tokio::test]
    async fn rejected_credentials_fail_wrap() {
        let vault = FakeVault::start().await;
        let mut config = vault.config("state");
        config.secret_id = "wrong".to_owned();
        let provider = TransitProvider::from_config(&config).unwrap();

        let result = provider.wrap(&EncryptionKey::generate()).await;
        assert!(matches!(
            result,
            Err(KeyProviderError::ServiceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn unavailable_service_is_retried() {
        let vault = FakeVault::start().await;
        vault.fail_next_encrypts(1);
        let provider = TransitProvider::from_config(&vault.config("state")).unwrap();
        let data_key = EncryptionKey::generate();

        let wrapped = provider.wrap(&data_key).await.unwrap();
        assert_eq!(vault.encrypt_count(), 2);
        let recovered = provider.unwrap(&wrapped).await.unwrap();
        assert_eq!(recovered.as_bytes(), data_key.as_bytes());
    }

    #[tokio::test]
    async fn retries_stop_at_retry_max() {
        let vault = FakeVault::start().await;
        vault.fail_next_encrypts(10);
        let mut config = vault.config("state");
        config.retry_max = 1;
        let provider = TransitProvider::from_config(&config).unwrap();

        let result = provider.wrap(&EncryptionKey::generate()).await;
        assert!(matches!(
            result,
            Err(KeyProviderError::ServiceUnavailable { .. })
        ));
        assert_eq!(vault.encrypt_count(), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let vault = FakeVault::start().await;
        let mut config = vault.config("state");
        config.secret_id = "wrong".to_owned();
        let provider = TransitProvider::from_config(&config).unwrap();

        assert!(provider.wrap(&EncryptionKey::generate()).await.is_err());
        assert_eq!(vault.login_count(), 1);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut config = TransitConfig::new("http://vault:8200", "r", "s", "state");
        config.retry_wait_min = Duration::from_millis(100);
        config.retry_wait_max = Duration::from_millis(350);
        let client = TransitClient::new(&config).unwrap();
        assert_eq!(client.backoff(0), Duration::from_millis(100));
        assert_eq!(client.backoff(1), Duration::from_millis(200));
        assert_eq!(client.backoff(2), Duration::from_millis(350));
        assert_eq!(client.backoff(30), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn unreachable_service_fails_wrap() {
        let mut config = TransitConfig::new("http://127.0.0.1:1", "role", "secret", "state");
        config.retry_wait_min = Duration::from_millis(1);
        config.retry_wait_max = Duration::from_millis(1);
        let provider = TransitProvider::from_config(&config).unwrap();
        let result = provider.wrap(&EncryptionKey::generate()).await;
        assert!(matches!(
            result,
            Err(KeyProviderError::ServiceUnavailable { .. })
        ));
    }

    #[test]
    fn transit_url_joins_segments() {
        assert_eq!(
            transit_url("http://vault:8200/", "/transit/", "encrypt", "state"),
            "http://vault:8200/v1/transit/encrypt/state"
        );
    }
}

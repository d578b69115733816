//! Key provider configuration consumed by the transform engine.
//!
//! These types carry secrets (the local private key, the `AppRole`
//! credentials), so their `Debug` implementations redact them.

use std::fmt;
use std::time::Duration;

/// Default transit engine mount path.
pub const DEFAULT_TRANSIT_MOUNT: &str = "transit";

/// Default safety margin subtracted from a login lease.
pub const DEFAULT_TOKEN_MARGIN: Duration = Duration::from_secs(60);

/// Retries after a failed transit request (connection error, 429 or 5xx).
pub const DEFAULT_RETRY_MAX: u32 = 2;

/// First backoff between transit retries; doubles up to [`DEFAULT_RETRY_WAIT_MAX`].
pub const DEFAULT_RETRY_WAIT_MIN: Duration = Duration::from_millis(1000);

pub const DEFAULT_RETRY_WAIT_MAX: Duration = Duration::from_millis(1500);

/// Key material for the local (age) provider.
#[derive(Clone, Default)]
pub struct LocalKeyConfig {
    /// `age1…` recipient. Required for encryption.
    pub public_key: Option<String>,
    /// `AGE-SECRET-KEY-1…` identity. Required only to decrypt through the
    /// local provider.
    pub private_key: Option<String>,
}

impl fmt::Debug for LocalKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyConfig")
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Connection settings for the remote transit key service.
#[derive(Clone)]
pub struct TransitConfig {
    /// Base URL of the key service, e.g. `https://vault.example.com:8200`.
    pub address: String,
    pub role_id: String,
    pub secret_id: String,
    /// Transit engine mount path.
    pub mount: String,
    /// Name of the transit key used for new envelopes.
    pub key_name: String,
    /// Margin subtracted from each login lease before the token is refreshed.
    pub token_margin: Duration,
    /// Retries per request after a retryable failure. Zero disables retries.
    pub retry_max: u32,
    pub retry_wait_min: Duration,
    pub retry_wait_max: Duration,
}

impl TransitConfig {
    /// Build a config with the default mount, token margin and retry policy.
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        role_id: impl Into<String>,
        secret_id: impl Into<String>,
        key_name: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            role_id: role_id.into(),
            secret_id: secret_id.into(),
            mount: DEFAULT_TRANSIT_MOUNT.to_owned(),
            key_name: key_name.into(),
            token_margin: DEFAULT_TOKEN_MARGIN,
            retry_max: DEFAULT_RETRY_MAX,
            retry_wait_min: DEFAULT_RETRY_WAIT_MIN,
            retry_wait_max: DEFAULT_RETRY_WAIT_MAX,
        }
    }
}

impl fmt::Debug for TransitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitConfig")
            .field("address", &self.address)
            .field("role_id", &"[REDACTED]")
            .field("secret_id", &"[REDACTED]")
            .field("mount", &self.mount)
            .field("key_name", &self.key_name)
            .field("token_margin", &self.token_margin)
            .field("retry_max", &self.retry_max)
            .field("retry_wait_min", &self.retry_wait_min)
            .field("retry_wait_max", &self.retry_wait_max)
            .finish()
    }
}

/// Everything the transform engine needs to assemble its key group.
#[derive(Debug, Clone, Default)]
pub struct TransformConfig {
    pub local: LocalKeyConfig,
    /// Remote provider settings. `None` disables the transit provider.
    pub transit: Option<TransitConfig>,
}

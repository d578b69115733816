//! Key provider abstraction and the key group used for each document.
//!
//! A provider wraps the per-document data key into an entry stored in the
//! envelope metadata, and unwraps such an entry back into the data key. Two
//! providers exist: the local age provider and the remote transit provider.
//! Every envelope carries one entry per provider in the key group, so either
//! one alone can recover the data key.
//!
//! A [`KeyObserver`] attached to the [`KeyService`] sees the outcome and
//! duration of every provider call.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::crypto::EncryptionKey;
use crate::error::{KeyProviderError, TransformError};
use crate::local::{LocalKeyEntry, LocalProvider};
use crate::transit::{TransitKeyEntry, TransitProvider};

/// Which provider produced (and can unwrap) a key entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Local,
    Transit,
}

impl ProviderKind {
    /// Short name used in logs and error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Transit => "transit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOperation {
    Wrap,
    Unwrap,
}

impl KeyOperation {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Wrap => "wrap",
            Self::Unwrap => "unwrap",
        }
    }
}

/// Receives every provider call made by a [`KeyService`].
pub trait KeyObserver: Send + Sync {
    fn key_operation(
        &self,
        provider: ProviderKind,
        operation: KeyOperation,
        ok: bool,
        elapsed: Duration,
    );
}

/// A data key wrapped by one provider, as stored in the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrappedKey {
    Local(LocalKeyEntry),
    Transit(TransitKeyEntry),
}

impl WrappedKey {
    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Local(_) => ProviderKind::Local,
            Self::Transit(_) => ProviderKind::Transit,
        }
    }
}

/// Wraps and unwraps data keys.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Wrap `data_key` into an envelope entry.
    async fn wrap(&self, data_key: &EncryptionKey) -> Result<WrappedKey, KeyProviderError>;

    /// Recover the data key from an entry this provider produced.
    async fn unwrap(&self, wrapped: &WrappedKey) -> Result<EncryptionKey, KeyProviderError>;
}

/// The configured providers of one transformer.
pub struct KeyService {
    local: LocalProvider,
    transit: Option<TransitProvider>,
    observer: Option<Arc<dyn KeyObserver>>,
}

impl KeyService {
    #[must_use]
    pub fn new(local: LocalProvider, transit: Option<TransitProvider>) -> Self {
        Self {
            local,
            transit,
            observer: None,
        }
    }

    /// Report every provider call to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn KeyObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn observe(&self, provider: ProviderKind, operation: KeyOperation, ok: bool, start: Instant) {
        if let Some(observer) = &self.observer {
            observer.key_operation(provider, operation, ok, start.elapsed());
        }
    }

    /// The providers every new envelope is wrapped with: always the local
    /// provider, plus the transit provider when configured.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::KeyProviderConfig`] if the local provider has
    /// no usable public key.
    pub fn key_group(&self) -> Result<Vec<&dyn KeyProvider>, TransformError> {
        self.local
            .recipient()
            .map_err(TransformError::KeyProviderConfig)?;

        let mut group: Vec<&dyn KeyProvider> = vec![&self.local];
        if let Some(transit) = &self.transit {
            group.push(transit);
        }
        Ok(group)
    }

    /// Wrap `data_key` with every provider in the key group, in order.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::KeyWrap`] naming the first provider that
    /// failed; no partial key group is ever returned.
    pub async fn wrap_all(
        &self,
        data_key: &EncryptionKey,
    ) -> Result<Vec<WrappedKey>, TransformError> {
        let group = self.key_group()?;
        let mut entries = Vec::with_capacity(group.len());
        for provider in group {
            let start = Instant::now();
            let result = provider.wrap(data_key).await;
            self.observe(provider.kind(), KeyOperation::Wrap, result.is_ok(), start);
            let entry = result.map_err(|source| TransformError::KeyWrap {
                    provider: provider.kind().name(),
                    source,
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Provider responsible for an entry. Transit entries go to the transit
    /// provider; anything else is handled locally.
    fn provider_for(&self, entry: &WrappedKey) -> Result<&dyn KeyProvider, KeyProviderError> {
        match entry {
            WrappedKey::Transit(_) => self
                .transit
                .as_ref()
                .map(|t| t as &dyn KeyProvider)
                .ok_or_else(|| KeyProviderError::ServiceUnavailable {
                    reason: "transit provider is not configured".to_owned(),
                }),
            WrappedKey::Local(_) => Ok(&self.local),
        }
    }

    /// Try each entry in storage order and return the first recovered key.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::KeyUnwrap`] listing every failure if no
    /// entry could be unwrapped.
    pub async fn unwrap_any(
        &self,
        entries: &[WrappedKey],
    ) -> Result<EncryptionKey, TransformError> {
        let mut attempts = Vec::with_capacity(entries.len());
        for entry in entries {
            let kind = entry.kind().name();
            let result = match self.provider_for(entry) {
                Ok(provider) => {
                    let start = Instant::now();
                    let result = provider.unwrap(entry).await;
                    self.observe(provider.kind(), KeyOperation::Unwrap, result.is_ok(), start);
                    result
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(key) => {
                    debug!(provider = kind, "unwrapped data key");
                    return Ok(key);
                }
                Err(e) => {
                    warn!(provider = kind, error = %e, "key entry could not be unwrapped");
                    attempts.push(format!("{kind}: {e}"));
                }
            }
        }
        Err(TransformError::KeyUnwrap { attempts })
    }
}

impl fmt::Debug for KeyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyService")
            .field("local", &self.local)
            .field("transit", &self.transit)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::LocalKeyConfig;
    use crate::local::Identity;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ProviderKind, KeyOperation, bool)>>,
    }

    impl KeyObserver for Recorder {
        fn key_operation(
            &self,
            provider: ProviderKind,
            operation: KeyOperation,
            ok: bool,
            _elapsed: Duration,
        ) {
            self.calls.lock().unwrap().push((provider, operation, ok));
        }
    }

    fn local(identity: &Identity) -> LocalProvider {
        LocalProvider::new(&LocalKeyConfig {
            public_key: Some(identity.recipient().to_string()),
            private_key: Some(identity.to_encoded().to_string()),
        })
    }

    #[tokio::test]
    async fn observer_sees_every_provider_call() {
        let recorder = Arc::new(Recorder::default());
        let writer = KeyService::new(local(&Identity::generate()), None)
            .with_observer(recorder.clone());
        let reader = KeyService::new(local(&Identity::generate()), None)
            .with_observer(recorder.clone());

        let entries = writer.wrap_all(&EncryptionKey::generate()).await.unwrap();
        writer.unwrap_any(&entries).await.unwrap();
        assert!(reader.unwrap_any(&entries).await.is_err());

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec![
                (ProviderKind::Local, KeyOperation::Wrap, true),
                (ProviderKind::Local, KeyOperation::Unwrap, true),
                (ProviderKind::Local, KeyOperation::Unwrap, false),
            ]
        );
    }

    #[tokio::test]
    async fn missing_transit_provider_is_reported_per_entry() {
        let service = KeyService::new(local(&Identity::generate()), None);
        let entry = WrappedKey::Transit(TransitKeyEntry {
            vault_address: "http://vault:8200".to_owned(),
            engine_path: "transit".to_owned(),
            key_name: "state".to_owned(),
            created_at: "2024-01-01T00:00:00Z".to_owned(),
            enc: "vault:v1:abc".to_owned(),
        });

        let Err(TransformError::KeyUnwrap { attempts }) = service.unwrap_any(&[entry]).await else {
            unreachable!("expected a key unwrap failure");
        };
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].starts_with("transit:"));
    }
}

//! Document transform engine.
//!
//! [`Transformer::encrypt`] turns a plaintext state document into an
//! envelope: a fresh data key encrypts every non-exempt leaf in place, the
//! key is wrapped by each provider in the key group, and the metadata is
//! attached under the `sops` key. [`Transformer::decrypt`] reverses this,
//! recovering the data key from the first stored entry that can be unwrapped
//! and verifying the document MAC before returning anything.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::config::TransformConfig;
use crate::crypto::{self, EncryptedValue, EncryptionKey, ValueType};
use crate::document::{
    ExemptFields, METADATA_KEY, additional_data, leaf_from_plaintext, leaf_plaintext,
    visit_leaves,
};
use crate::envelope::{MacBuilder, Metadata};
use crate::error::{KeyProviderError, TransformError};
use crate::local::LocalProvider;
use crate::provider::{KeyObserver, KeyService};
use crate::transit::TransitProvider;

/// Encrypts and decrypts whole documents. Implemented by [`Transformer`];
/// the proxy depends only on this trait.
#[async_trait]
pub trait DocumentTransformer: Send + Sync {
    /// Encrypt a plaintext JSON object into an envelope.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, TransformError>;

    /// Decrypt an envelope back into the plaintext document.
    async fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, TransformError>;
}

/// The transform engine bound to one key provider configuration.
#[derive(Debug)]
pub struct Transformer {
    keys: KeyService,
    exempt: ExemptFields,
}

impl Transformer {
    /// Build a transformer from provider configuration.
    ///
    /// Missing local keys are not an error here; they surface when an
    /// operation needs them.
    ///
    /// # Errors
    ///
    /// Returns an error if the transit client cannot be constructed.
    pub fn new(config: &TransformConfig) -> Result<Self, KeyProviderError> {
        let local = LocalProvider::new(&config.local);
        let transit = config
            .transit
            .as_ref()
            .map(TransitProvider::from_config)
            .transpose()?;
        Ok(Self::with_key_service(KeyService::new(local, transit)))
    }

    /// Report every key provider call to `observer`.
    #[must_use]
    pub fn with_observer(self, observer: Arc<dyn KeyObserver>) -> Self {
        Self {
            keys: self.keys.with_observer(observer),
            exempt: self.exempt,
        }
    }

    /// Build a transformer around an existing key service.
    #[must_use]
    pub fn with_key_service(keys: KeyService) -> Self {
        Self {
            keys,
            exempt: ExemptFields::state_defaults(),
        }
    }

    fn parse_document(plaintext: &[u8]) -> Result<Map<String, Value>, TransformError> {
        let document: Value =
            serde_json::from_slice(plaintext).map_err(|e| TransformError::InvalidDocument {
                reason: e.to_string(),
            })?;
        let Value::Object(map) = document else {
            return Err(TransformError::InvalidDocument {
                reason: "top level must be a JSON object".to_owned(),
            });
        };
        if map.is_empty() {
            return Err(TransformError::EmptyInput);
        }
        if map.contains_key(METADATA_KEY) {
            return Err(TransformError::AlreadyEncrypted);
        }
        Ok(map)
    }

    fn parse_envelope(envelope: &[u8]) -> Result<(Map<String, Value>, Metadata), TransformError> {
        let malformed = |reason: String| TransformError::MalformedEnvelope { reason };

        let document: Value =
            serde_json::from_slice(envelope).map_err(|e| malformed(e.to_string()))?;
        let Value::Object(mut map) = document else {
            return Err(malformed("top level must be a JSON object".to_owned()));
        };
        let raw = map
            .remove(METADATA_KEY)
            .ok_or_else(|| malformed(format!("missing '{METADATA_KEY}' metadata")))?;
        let metadata: Metadata = serde_json::from_value(raw)
            .map_err(|e| malformed(format!("invalid '{METADATA_KEY}' metadata: {e}")))?;
        Ok((map, metadata))
    }
}

fn integrity(path: &[String], reason: impl std::fmt::Display) -> TransformError {
    TransformError::Integrity {
        reason: format!("value at '{}': {reason}", additional_data(path)),
    }
}

fn encrypt_leaves(
    map: &mut Map<String, Value>,
    exempt: &ExemptFields,
    data_key: &EncryptionKey,
) -> Result<String, TransformError> {
    let mut mac = MacBuilder::new();
    visit_leaves(map, exempt, &mut |value, path, is_exempt| {
        let Some((text, kind)) = leaf_plaintext(value) else {
            return Ok(());
        };
        mac.update(text.as_bytes());
        if is_exempt || text.is_empty() {
            return Ok(());
        }
        let aad = additional_data(path);
        let encrypted = crypto::encrypt_value(data_key, text.as_bytes(), kind, aad.as_bytes())?;
        *value = Value::String(encrypted.to_string());
        Ok(())
    })?;
    Ok(mac.finish())
}

fn decrypt_leaves(
    map: &mut Map<String, Value>,
    exempt: &ExemptFields,
    data_key: &EncryptionKey,
) -> Result<String, TransformError> {
    let mut mac = MacBuilder::new();
    visit_leaves(map, exempt, &mut |value, path, is_exempt| {
        if is_exempt {
            if let Some((text, _)) = leaf_plaintext(value) {
                mac.update(text.as_bytes());
            }
            return Ok(());
        }
        let Value::String(raw) = value else {
            return Err(integrity(path, "value is not encrypted"));
        };
        if raw.is_empty() {
            return Ok(());
        }

        let encrypted: EncryptedValue = raw.parse().map_err(|e| integrity(path, e))?;
        let aad = additional_data(path);
        let plain = crypto::decrypt_value(data_key, &encrypted, aad.as_bytes())
            .map_err(|e| integrity(path, e))?;
        let text = String::from_utf8(plain).map_err(|e| integrity(path, e))?;
        mac.update(text.as_bytes());
        *value = leaf_from_plaintext(&text, encrypted.value_type).map_err(|e| integrity(path, e))?;
        Ok(())
    })?;
    Ok(mac.finish())
}

fn verify_mac(
    metadata: &Metadata,
    data_key: &EncryptionKey,
    computed: &str,
) -> Result<(), TransformError> {
    let mac_error = |reason: String| TransformError::Integrity { reason };

    let stored: EncryptedValue = metadata
        .mac
        .parse()
        .map_err(|e| mac_error(format!("stored MAC is unreadable: {e}")))?;
    let expected = crypto::decrypt_value(data_key, &stored, metadata.lastmodified.as_bytes())
        .map_err(|e| mac_error(format!("stored MAC failed authentication: {e}")))?;

    if bool::from(expected.as_slice().ct_eq(computed.as_bytes())) {
        Ok(())
    } else {
        Err(mac_error("MAC mismatch: document was modified".to_owned()))
    }
}

#[async_trait]
impl DocumentTransformer for Transformer {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, TransformError> {
        let start = Instant::now();
        let mut map = Self::parse_document(plaintext)?;

        let data_key = EncryptionKey::generate();
        let entries = self.keys.wrap_all(&data_key).await?;
        let digest = encrypt_leaves(&mut map, &self.exempt, &data_key)?;

        let lastmodified = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mac = crypto::encrypt_value(
            &data_key,
            digest.as_bytes(),
            ValueType::Str,
            lastmodified.as_bytes(),
        )?;
        let key_count = entries.len();
        let metadata = Metadata::new(entries, &self.exempt, lastmodified, mac.to_string());
        map.insert(METADATA_KEY.to_owned(), serde_json::to_value(&metadata)?);

        let output = serde_json::to_vec_pretty(&Value::Object(map))?;
        info!(
            key_entries = key_count,
            bytes = output.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "encrypted document"
        );
        Ok(output)
    }

    async fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, TransformError> {
        let start = Instant::now();
        let (mut map, metadata) = Self::parse_envelope(envelope)?;
        let exempt = ExemptFields::from_pattern(&metadata.unencrypted_regex)?;

        let data_key = self.keys.unwrap_any(&metadata.key_entries()).await?;
        let digest = decrypt_leaves(&mut map, &exempt, &data_key)?;
        verify_mac(&metadata, &data_key, &digest)?;

        let output = serde_json::to_vec_pretty(&Value::Object(map))?;
        debug!(
            bytes = output.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "decrypted document"
        );
        Ok(output)
    }
}

//! Local key provider backed by age X25519 keys.
//!
//! The data key is encrypted to the configured `age1…` recipient and stored
//! ASCII-armored, exactly as an `age` key group entry of a SOPS document.
//! Decryption needs the matching `AGE-SECRET-KEY-1…` identity.

use std::fmt;

use age::secrecy::ExposeSecret;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::LocalKeyConfig;
use crate::crypto::EncryptionKey;
use crate::error::{CryptoError, KeyProviderError};
use crate::provider::{KeyProvider, ProviderKind, WrappedKey};

/// A data key encrypted to one age recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalKeyEntry {
    /// `age1…` recipient the data key was encrypted to.
    pub recipient: String,
    /// Armored age file holding the raw data key.
    pub enc: String,
}

/// An age X25519 public key that data keys are encrypted to.
#[derive(Clone)]
pub struct Recipient(age::x25519::Recipient);

impl Recipient {
    /// Parse an `age1…` public key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyProviderError::InvalidKeyMaterial`] if the value is not a
    /// valid age X25519 recipient.
    pub fn parse(encoded: &str) -> Result<Self, KeyProviderError> {
        encoded
            .trim()
            .parse()
            .map(Self)
            .map_err(|e| KeyProviderError::InvalidKeyMaterial {
                reason: format!("public key is not an age recipient: {e}"),
            })
    }
}

impl PartialEq for Recipient {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for Recipient {}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Recipient").field(&self.to_string()).finish()
    }
}

/// An age X25519 private key able to decrypt entries for its recipient.
pub struct Identity(age::x25519::Identity);

impl Identity {
    /// Generate a new random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(age::x25519::Identity::generate())
    }

    /// Parse an `AGE-SECRET-KEY-1…` private key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyProviderError::InvalidKeyMaterial`] if the value is not a
    /// valid age X25519 identity.
    pub fn parse(encoded: &str) -> Result<Self, KeyProviderError> {
        encoded
            .trim()
            .parse()
            .map(Self)
            .map_err(|e| KeyProviderError::InvalidKeyMaterial {
                reason: format!("private key is not an age identity: {e}"),
            })
    }

    /// The recipient (public key) matching this identity.
    #[must_use]
    pub fn recipient(&self) -> Recipient {
        Recipient(self.0.to_public())
    }

    /// The `AGE-SECRET-KEY-1…` encoding. Handle like any other secret.
    #[must_use]
    pub fn to_encoded(&self) -> Zeroizing<String> {
        Zeroizing::new(self.0.to_string().expose_secret().to_owned())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("recipient", &self.recipient().to_string())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt `data_key` to `recipient`.
///
/// # Errors
///
/// Returns [`KeyProviderError::Crypto`] if age encryption fails.
pub fn wrap_for(
    recipient: &Recipient,
    data_key: &EncryptionKey,
) -> Result<LocalKeyEntry, KeyProviderError> {
    let enc = age::encrypt_and_armor(&recipient.0, data_key.as_bytes()).map_err(|e| {
        CryptoError::Encryption {
            reason: e.to_string(),
        }
    })?;
    Ok(LocalKeyEntry {
        recipient: recipient.to_string(),
        enc,
    })
}

/// Recover the data key from `entry` with `identity`.
///
/// # Errors
///
/// Returns [`KeyProviderError::InvalidKeyMaterial`] if the entry was not
/// encrypted to this identity, and [`KeyProviderError::Crypto`] if the entry
/// is malformed, fails authentication or does not hold a 256-bit key.
pub fn unwrap_with(
    identity: &Identity,
    entry: &LocalKeyEntry,
) -> Result<EncryptionKey, KeyProviderError> {
    let plain = age::decrypt(&identity.0, entry.enc.as_bytes())
        .map(Zeroizing::new)
        .map_err(|e| match e {
            age::DecryptError::NoMatchingKeys => KeyProviderError::InvalidKeyMaterial {
                reason: format!(
                    "entry for recipient {} was not encrypted to this private key",
                    entry.recipient
                ),
            },
            other => CryptoError::Decryption {
                reason: other.to_string(),
            }
            .into(),
        })?;
    Ok(EncryptionKey::from_slice(&plain)?)
}

/// The local provider bound to configured key material.
pub struct LocalProvider {
    public_key: Option<String>,
    private_key: Option<String>,
}

impl LocalProvider {
    #[must_use]
    pub fn new(config: &LocalKeyConfig) -> Self {
        Self {
            public_key: non_empty(config.public_key.as_deref()),
            private_key: non_empty(config.private_key.as_deref()),
        }
    }

    /// The configured recipient.
    ///
    /// # Errors
    ///
    /// Returns [`KeyProviderError::MissingPublicKey`] if none is configured,
    /// or [`KeyProviderError::InvalidKeyMaterial`] if it cannot be parsed.
    pub fn recipient(&self) -> Result<Recipient, KeyProviderError> {
        self.public_key
            .as_deref()
            .ok_or(KeyProviderError::MissingPublicKey)
            .and_then(Recipient::parse)
    }

    fn identity(&self) -> Result<Identity, KeyProviderError> {
        self.private_key
            .as_deref()
            .ok_or(KeyProviderError::MissingPrivateKey)
            .and_then(Identity::parse)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

impl fmt::Debug for LocalProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProvider")
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait]
impl KeyProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn wrap(&self, data_key: &EncryptionKey) -> Result<WrappedKey, KeyProviderError> {
        let recipient = self.recipient()?;
        wrap_for(&recipient, data_key).map(WrappedKey::Local)
    }

    async fn unwrap(&self, wrapped: &WrappedKey) -> Result<EncryptionKey, KeyProviderError> {
        let WrappedKey::Local(entry) = wrapped else {
            return Err(KeyProviderError::WrongEntry {
                provider: ProviderKind::Local.name(),
                entry: wrapped.kind().name(),
            });
        };
        let identity = self.identity()?;
        unwrap_with(&identity, entry)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Same pair as `tests/fixtures/sops-age.tfstate.json`.
    const KNOWN_IDENTITY: &str =
        "AGE-SECRET-KEY-19QMWNNXJ67FDWQKJNWK6DKN8FXRX0PAGM05Y0X8J7NJ5MX8T22XSHZRZG8";
    const KNOWN_RECIPIENT: &str =
        "age170mum2rdnleg5g5xrruw97u5j50f3rs24p8tucmjswtgwppplqks906hjh";

    fn provider_for(identity: &Identity, with_private: bool) -> LocalProvider {
        LocalProvider::new(&LocalKeyConfig {
            public_key: Some(identity.recipient().to_string()),
            private_key: with_private.then(|| identity.to_encoded().to_string()),
        })
    }

    #[tokio::test]
    async fn wrap_unwrap_roundtrip() {
        let identity = Identity::generate();
        let provider = provider_for(&identity, true);
        let data_key = EncryptionKey::generate();

        let wrapped = provider.wrap(&data_key).await.unwrap();
        let recovered = provider.unwrap(&wrapped).await.unwrap();
        assert_eq!(recovered.as_bytes(), data_key.as_bytes());
    }

    #[tokio::test]
    async fn entry_is_armored_age_file() {
        let identity = Identity::generate();
        let provider = provider_for(&identity, false);
        let wrapped = provider.wrap(&EncryptionKey::generate()).await.unwrap();
        let WrappedKey::Local(entry) = wrapped else {
            unreachable!("local provider produced a non-local entry");
        };
        assert_eq!(entry.recipient, identity.recipient().to_string());
        assert!(entry.recipient.starts_with("age1"));
        assert!(entry.enc.starts_with("-----BEGIN AGE ENCRYPTED FILE-----\n"));
        assert!(entry.enc.trim_end().ends_with("-----END AGE ENCRYPTED FILE-----"));
    }

    #[tokio::test]
    async fn wrap_without_public_key_fails() {
        let provider = LocalProvider::new(&LocalKeyConfig::default());
        let result = provider.wrap(&EncryptionKey::generate()).await;
        assert!(matches!(result, Err(KeyProviderError::MissingPublicKey)));
    }

    #[tokio::test]
    async fn blank_public_key_counts_as_missing() {
        let provider = LocalProvider::new(&LocalKeyConfig {
            public_key: Some("   ".to_owned()),
            private_key: None,
        });
        assert!(matches!(
            provider.recipient(),
            Err(KeyProviderError::MissingPublicKey)
        ));
    }

    #[tokio::test]
    async fn unwrap_without_private_key_fails() {
        let identity = Identity::generate();
        let provider = provider_for(&identity, false);
        let wrapped = provider.wrap(&EncryptionKey::generate()).await.unwrap();
        let result = provider.unwrap(&wrapped).await;
        assert!(matches!(result, Err(KeyProviderError::MissingPrivateKey)));
    }

    #[test]
    fn unwrap_with_other_identity_fails() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let entry = wrap_for(&alice.recipient(), &EncryptionKey::generate()).unwrap();
        assert!(matches!(
            unwrap_with(&bob, &entry),
            Err(KeyProviderError::InvalidKeyMaterial { .. })
        ));
    }

    #[test]
    fn garbage_entry_is_a_crypto_error() {
        let identity = Identity::generate();
        let entry = LocalKeyEntry {
            recipient: identity.recipient().to_string(),
            enc: "-----BEGIN AGE ENCRYPTED FILE-----\nnot age\n-----END AGE ENCRYPTED FILE-----\n"
                .to_owned(),
        };
        assert!(matches!(
            unwrap_with(&identity, &entry),
            Err(KeyProviderError::Crypto(_))
        ));
    }

    #[test]
    fn parse_rejects_bad_keys() {
        assert!(Recipient::parse("not a key").is_err());
        assert!(Recipient::parse("AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=").is_err());
        assert!(Identity::parse("").is_err());
        assert!(Identity::parse(KNOWN_RECIPIENT).is_err());
    }

    #[test]
    fn known_identity_matches_known_recipient() {
        let identity = Identity::parse(KNOWN_IDENTITY).unwrap();
        assert_eq!(identity.recipient().to_string(), KNOWN_RECIPIENT);
        assert_eq!(identity.recipient(), Recipient::parse(KNOWN_RECIPIENT).unwrap());
    }

    #[test]
    fn identity_roundtrips_through_encoding() {
        let identity = Identity::generate();
        let encoded = identity.to_encoded();
        assert!(encoded.starts_with("AGE-SECRET-KEY-1"));
        let parsed = Identity::parse(&encoded).unwrap();
        assert_eq!(parsed.recipient(), identity.recipient());
    }

    #[test]
    fn identity_debug_redacts_secret() {
        let identity = Identity::generate();
        let debug = format!("{identity:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(identity.to_encoded().as_str()));
    }
}

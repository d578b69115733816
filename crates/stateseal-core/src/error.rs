//! Error types for `stateseal-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. No variant ever includes key material or decrypted values.

/// Errors from symmetric cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decryption failed (wrong key, wrong key path, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// An encrypted value could not be parsed.
    #[error("malformed encrypted value: {reason}")]
    Malformed { reason: String },

    /// Key material had the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Errors from a key provider's wrap or unwrap operation.
#[derive(Debug, thiserror::Error)]
pub enum KeyProviderError {
    /// The local provider has no public key to wrap for.
    #[error("no public key configured for the local provider")]
    MissingPublicKey,

    /// The local provider has no private key to unwrap with.
    #[error("no private key configured for the local provider")]
    MissingPrivateKey,

    /// Configured or stored key material could not be decoded.
    #[error("invalid key material: {reason}")]
    InvalidKeyMaterial { reason: String },

    /// The remote key service could not be reached or refused the request.
    #[error("key service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    /// The remote key service answered with something we could not use.
    #[error("unexpected key service response: {reason}")]
    InvalidResponse { reason: String },

    /// An entry of a kind this provider does not handle.
    #[error("{provider} provider cannot unwrap a {entry} key entry")]
    WrongEntry {
        provider: &'static str,
        entry: &'static str,
    },

    /// A cryptographic operation inside the provider failed.
    #[error("key provider crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors from encrypting or decrypting a state document.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The configured key providers cannot be used.
    #[error("key provider configuration failure: {0}")]
    KeyProviderConfig(#[source] KeyProviderError),

    /// The input already carries encryption metadata.
    #[error("input is already encrypted")]
    AlreadyEncrypted,

    /// The input is an empty document.
    #[error("input cannot be completely empty, it must contain at least one document entry")]
    EmptyInput,

    /// The input is not a JSON object.
    #[error("invalid input document: {reason}")]
    InvalidDocument { reason: String },

    /// The envelope is not well-formed JSON or its metadata is unusable.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    /// A provider in the key group failed to wrap the data key.
    #[error("could not wrap data key with the {provider} provider: {source}")]
    KeyWrap {
        provider: &'static str,
        #[source]
        source: KeyProviderError,
    },

    /// No stored key entry could be unwrapped.
    #[error("could not unwrap data key: {}", describe_attempts(.attempts))]
    KeyUnwrap { attempts: Vec<String> },

    /// A leaf or the document MAC failed authentication.
    #[error("failed to verify data integrity: {reason}")]
    Integrity { reason: String },

    /// Leaf encryption failed.
    #[error("transform crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The output document could not be serialized.
    #[error("could not serialize document: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransformError {
    /// Whether the error was caused by the shape of the caller's input rather
    /// than by key providers or the service itself.
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyEncrypted
                | Self::EmptyInput
                | Self::InvalidDocument { .. }
                | Self::MalformedEnvelope { .. }
        )
    }
}

fn describe_attempts(attempts: &[String]) -> String {
    if attempts.is_empty() {
        "no key entries are stored in the envelope".to_owned()
    } else {
        attempts.join("; ")
    }
}

//! Cryptographic primitives for `stateseal`.
//!
//! Provides the zeroize-on-drop key newtype used for data keys and the leaf
//! value cipher used inside encrypted envelopes.
//!
//! # Leaf value format
//!
//! Every encrypted leaf is rendered as
//! `ENC[AES256_GCM,data:<b64>,iv:<b64>,tag:<b64>,type:<type>]`:
//!
//! - AES-256-GCM with a fresh 256-bit IV drawn from `OsRng` per value.
//! - The key path of the leaf (`a:b:c:`) is bound as additional data, so a
//!   ciphertext moved to another key fails authentication.
//! - `type` records the JSON scalar kind so decryption restores it exactly.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::consts::U32;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// AES-256-GCM with a 256-bit IV.
type LeafCipher = AesGcm<Aes256, U32>;

/// IV length for leaf values.
const IV_LEN: usize = 32;

/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;

/// Length of a data key in bytes.
pub const KEY_LEN: usize = 32;

const VALUE_PREFIX: &str = "ENC[AES256_GCM,";

/// A 256-bit symmetric key that is zeroized on drop.
///
/// Used for the per-document data key. The inner bytes are never exposed in
/// `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Create a key from a byte slice, checking its length.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = LeafCipher::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// The caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// JSON scalar kind recorded alongside an encrypted leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Str,
    Int,
    Float,
    Bool,
}

impl ValueType {
    /// Tag used in the `type:` field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

impl FromStr for ValueType {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "str" => Ok(Self::Str),
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "bool" => Ok(Self::Bool),
            other => Err(CryptoError::Malformed {
                reason: format!("unknown value type '{other}'"),
            }),
        }
    }
}

/// A parsed `ENC[...]` leaf value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue {
    pub data: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub value_type: ValueType,
}

impl fmt::Display for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{VALUE_PREFIX}data:{},iv:{},tag:{},type:{}]",
            BASE64.encode(&self.data),
            BASE64.encode(&self.iv),
            BASE64.encode(&self.tag),
            self.value_type.as_str()
        )
    }
}

impl FromStr for EncryptedValue {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(VALUE_PREFIX)
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| CryptoError::Malformed {
                reason: "value does not match the encrypted value format".to_owned(),
            })?;

        let mut data = None;
        let mut iv = None;
        let mut tag = None;
        let mut value_type = None;

        for part in body.split(',') {
            let (name, value) = part.split_once(':').ok_or_else(|| CryptoError::Malformed {
                reason: format!("field '{part}' has no value"),
            })?;
            match name {
                "data" => data = Some(decode_field(name, value)?),
                "iv" => iv = Some(decode_field(name, value)?),
                "tag" => tag = Some(decode_field(name, value)?),
                "type" => value_type = Some(value.parse()?),
                other => {
                    return Err(CryptoError::Malformed {
                        reason: format!("unknown field '{other}'"),
                    });
                }
            }
        }

        let missing = |field: &str| CryptoError::Malformed {
            reason: format!("missing field '{field}'"),
        };
        Ok(Self {
            data: data.ok_or_else(|| missing("data"))?,
            iv: iv.ok_or_else(|| missing("iv"))?,
            tag: tag.ok_or_else(|| missing("tag"))?,
            value_type: value_type.ok_or_else(|| missing("type"))?,
        })
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64.decode(value).map_err(|e| CryptoError::Malformed {
        reason: format!("field '{name}' is not valid base64: {e}"),
    })
}

/// Encrypt a leaf value, binding `aad` as additional authenticated data.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt_value(
    key: &EncryptionKey,
    plaintext: &[u8],
    value_type: ValueType,
    aad: &[u8],
) -> Result<EncryptedValue, CryptoError> {
    let cipher = LeafCipher::new(Key::<LeafCipher>::from_slice(key.as_bytes()));
    let iv = LeafCipher::generate_nonce(&mut OsRng);
    let mut sealed = cipher
        .encrypt(&iv, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    // aes-gcm appends the tag to the ciphertext.
    let tag = sealed.split_off(sealed.len().saturating_sub(TAG_LEN));
    Ok(EncryptedValue {
        data: sealed,
        iv: iv.to_vec(),
        tag,
        value_type,
    })
}

/// Decrypt a leaf value produced by [`encrypt_value`] under the same `aad`.
///
/// # Errors
///
/// Returns [`CryptoError::Malformed`] if the IV or tag have the wrong length.
///
/// Returns [`CryptoError::Decryption`] if authentication fails (wrong key,
/// wrong key path, corrupted data, or tampered tag).
pub fn decrypt_value(
    key: &EncryptionKey,
    value: &EncryptedValue,
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if value.iv.len() != IV_LEN {
        return Err(CryptoError::Malformed {
            reason: format!("iv must be {IV_LEN} bytes, got {}", value.iv.len()),
        });
    }
    if value.tag.len() != TAG_LEN {
        return Err(CryptoError::Malformed {
            reason: format!("tag must be {TAG_LEN} bytes, got {}", value.tag.len()),
        });
    }

    let mut sealed = Vec::with_capacity(value.data.len().saturating_add(TAG_LEN));
    sealed.extend_from_slice(&value.data);
    sealed.extend_from_slice(&value.tag);

    let cipher = LeafCipher::new(Key::<LeafCipher>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::<U32>::from_slice(&value.iv),
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

//! Envelope metadata stored under the top-level `sops` key.
//!
//! ```json
//! "sops": {
//!   "hc_vault": [{ "vault_address": "...", "engine_path": "transit",
//!                  "key_name": "...", "created_at": "...", "enc": "..." }],
//!   "age":      [{ "recipient": "age1...",
//!                  "enc": "-----BEGIN AGE ENCRYPTED FILE-----\n..." }],
//!   "lastmodified": "2024-01-01T00:00:00Z",
//!   "mac": "ENC[AES256_GCM,...,type:str]",
//!   "unencrypted_regex": "^(version|terraform_version|serial|lineage)$",
//!   "version": "3.9.4"
//! }
//! ```
//!
//! This is the SOPS metadata layout, so `sops --decrypt` reads envelopes
//! written here and envelopes written by `sops` decrypt here. Key groups
//! SOPS writes as `null` and providers this crate does not implement (`kms`,
//! `pgp`, ...) are accepted and ignored.
//!
//! The MAC is SHA-512 over the plaintext of every leaf in document order,
//! exempt leaves included, hex-encoded in uppercase and encrypted with the
//! data key using `lastmodified` as additional data.

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha512};

use crate::document::ExemptFields;
use crate::local::LocalKeyEntry;
use crate::provider::WrappedKey;
use crate::transit::TransitKeyEntry;

/// SOPS format version written into new envelopes.
pub const FORMAT_VERSION: &str = "3.9.4";

/// Metadata attached to every encrypted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub hc_vault: Vec<TransitKeyEntry>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub age: Vec<LocalKeyEntry>,
    pub lastmodified: String,
    pub mac: String,
    pub unencrypted_regex: String,
    #[serde(default)]
    pub version: String,
}

impl Metadata {
    /// Build metadata for a freshly encrypted document.
    #[must_use]
    pub fn new(
        entries: Vec<WrappedKey>,
        exempt: &ExemptFields,
        lastmodified: String,
        mac: String,
    ) -> Self {
        let mut age = Vec::new();
        let mut hc_vault = Vec::new();
        for entry in entries {
            match entry {
                WrappedKey::Local(e) => age.push(e),
                WrappedKey::Transit(e) => hc_vault.push(e),
            }
        }
        Self {
            hc_vault,
            age,
            lastmodified,
            mac,
            unencrypted_regex: exempt.to_pattern(),
            version: FORMAT_VERSION.to_owned(),
        }
    }

    /// Every stored key entry, local entries first.
    #[must_use]
    pub fn key_entries(&self) -> Vec<WrappedKey> {
        self.age
            .iter()
            .cloned()
            .map(WrappedKey::Local)
            .chain(self.hc_vault.iter().cloned().map(WrappedKey::Transit))
            .collect()
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Incremental document MAC.
#[derive(Default)]
pub struct MacBuilder {
    hasher: Sha512,
}

impl MacBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, leaf_plaintext: &[u8]) {
        self.hasher.update(leaf_plaintext);
    }

    /// Uppercase hex digest.
    #[must_use]
    pub fn finish(self) -> String {
        hex::encode_upper(self.hasher.finalize())
    }
}

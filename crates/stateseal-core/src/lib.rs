//! Core library for `stateseal`.
//!
//! Contains the envelope format for Terraform state documents, the leaf
//! cipher, the key providers that wrap per-document data keys (local age
//! and remote transit), the credential lease cache for the transit provider,
//! and the transform engine tying them together. This crate knows nothing
//! about HTTP serving; the proxy lives in `stateseal-server`.

pub mod config;
pub mod crypto;
pub mod document;
pub mod envelope;
pub mod error;
pub mod lease;
pub mod local;
pub mod provider;
pub mod transform;
pub mod transit;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{LocalKeyConfig, TransformConfig, TransitConfig};
pub use error::{KeyProviderError, TransformError};
pub use provider::{KeyObserver, KeyOperation, ProviderKind};
pub use transform::{DocumentTransformer, Transformer};

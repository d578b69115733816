//! `stateseal` HTTP server.
//!
//! An encrypting proxy between Terraform's HTTP state backend client and the
//! real backend, plus a separate monitoring listener. Encryption itself lives
//! in `stateseal-core`.

pub mod backend;
pub mod config;
pub mod error;
pub mod hardening;
pub mod metrics;
pub mod monitoring;
pub mod proxy;
pub mod state;

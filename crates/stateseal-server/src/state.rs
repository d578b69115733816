//! Shared application state for the `stateseal` server.
//!
//! A single [`AppState`] is constructed at startup and shared by the proxy
//! and monitoring routers via `Arc`.

use std::sync::Arc;

use stateseal_core::DocumentTransformer;

use crate::backend::BackendClient;
use crate::config::ProxySettings;
use crate::metrics::Metrics;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Backend URL, verb remapping and header rules.
    pub settings: ProxySettings,
    /// Client for the remote state backend.
    pub backend: Arc<dyn BackendClient>,
    /// Encrypts request bodies and decrypts response bodies.
    pub transformer: Arc<dyn DocumentTransformer>,
    /// Also observes key provider calls when handed to the transformer.
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// State with a fresh set of counters.
    #[must_use]
    pub fn new(
        settings: ProxySettings,
        backend: Arc<dyn BackendClient>,
        transformer: Arc<dyn DocumentTransformer>,
    ) -> Self {
        Self::with_metrics(settings, backend, transformer, Arc::new(Metrics::new()))
    }

    #[must_use]
    pub fn with_metrics(
        settings: ProxySettings,
        backend: Arc<dyn BackendClient>,
        transformer: Arc<dyn DocumentTransformer>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            backend,
            transformer,
            metrics,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

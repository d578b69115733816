//! Server configuration for `stateseal`.
//!
//! Settings come from three layers, highest precedence first: command line
//! flags, their environment variables, and a YAML file. Anything left unset
//! falls back to the defaults in [`ServerConfig::default`].
//!
//! The file lives at [`DEFAULT_CONFIG_PATH`] unless `--config` points
//! elsewhere. A missing file at the default path is not an error.
//!
//! ```yaml
//! transform:
//!   age:
//!     public_key: age1...
//!     private_key: AGE-SECRET-KEY-1...
//!   vault:
//!     address: https://vault:8200
//!     app_role: { id: ..., secret_id: ... }
//!     transit: { mount: sops, name: terraform }
//! server:
//!   port: 8080
//! backend:
//!   url: https://state.example.com
//!   lock_method: LOCK
//!   unlock_method: UNLOCK
//!   readiness_probe: { path: / }
//! log:
//!   level: info
//!   json: false
//! ```
//!
//! Environment variables are the upper-cased key paths with `.` replaced by
//! `_`, e.g. `TRANSFORM_VAULT_APP_ROLE_ID`. [`ServerConfig::validate`] runs
//! at startup and refuses to start with an incomplete key provider or backend
//! configuration.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::{HeaderName, Method};
use clap::Args;
use serde::Deserialize;
use stateseal_core::config::DEFAULT_RETRY_MAX;
use stateseal_core::{LocalKeyConfig, TransformConfig, TransitConfig};

/// Configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/stateseal/conf.yaml";

/// Default request body limit: 64 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Configuration errors reported while loading or by [`ServerConfig::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("a public key is required (--age-public-key / TRANSFORM_AGE_PUBLIC_KEY)")]
    MissingPublicKey,

    #[error("a backend URL is required (--backend-url / BACKEND_URL)")]
    MissingBackendUrl,

    #[error(
        "either a vault address or a private key is required, otherwise state cannot be decrypted"
    )]
    NoDecryptionKey,

    #[error("a vault address is set, so the AppRole role id and secret id are required")]
    MissingAppRole,

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("configuration file {}: {reason}", path.display())]
    File { path: PathBuf, reason: String },
}

/// Flags and environment variables of the `start` command.
///
/// Every setting is optional here so that an unset flag does not mask the
/// configuration file. [`StartArgs::load`] resolves the layers.
#[derive(Clone, Args)]
pub struct StartArgs {
    /// YAML configuration file.
    #[arg(long = "config", env = "STATESEAL_CONFIG", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// age recipient (`age1…`) every state file is encrypted for.
    #[arg(long, env = "TRANSFORM_AGE_PUBLIC_KEY")]
    pub age_public_key: Option<String>,

    /// age identity (`AGE-SECRET-KEY-1…`) used to decrypt state files.
    #[arg(long, env = "TRANSFORM_AGE_PRIVATE_KEY", hide_env_values = true)]
    pub age_private_key: Option<String>,

    /// Address of the key service hosting the transit engine.
    #[arg(long = "vault-addr", env = "TRANSFORM_VAULT_ADDRESS")]
    pub vault_address: Option<String>,

    #[arg(long, env = "TRANSFORM_VAULT_APP_ROLE_ID", hide_env_values = true)]
    pub vault_app_role_id: Option<String>,

    #[arg(long, env = "TRANSFORM_VAULT_APP_ROLE_SECRET_ID", hide_env_values = true)]
    pub vault_app_role_secret_id: Option<String>,

    /// Mount path of the transit engine [default: sops].
    #[arg(long, env = "TRANSFORM_VAULT_TRANSIT_MOUNT")]
    pub vault_transit_mount: Option<String>,

    /// Transit key used for new state files [default: terraform].
    #[arg(long, env = "TRANSFORM_VAULT_TRANSIT_NAME")]
    pub vault_transit_name: Option<String>,

    /// Seconds subtracted from each login lease before the token is renewed [default: 60].
    #[arg(long, env = "TRANSFORM_VAULT_TOKEN_MARGIN_SECS")]
    pub vault_token_margin_secs: Option<u64>,

    /// Retries for failed key service requests [default: 2].
    #[arg(long, env = "TRANSFORM_VAULT_RETRY_MAX")]
    pub vault_retry_max: Option<u32>,

    /// Port of the proxy listener [default: 8080].
    #[arg(long, env = "SERVER_PORT")]
    pub port: Option<u16>,

    /// Port of the monitoring listener [default: 2112].
    #[arg(long, env = "MONITORING_PORT")]
    pub monitoring_port: Option<u16>,

    /// Base URL of the HTTP state backend.
    #[arg(long, env = "BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Method sent to the backend for LOCK requests [default: LOCK].
    #[arg(long, env = "BACKEND_LOCK_METHOD")]
    pub backend_lock_method: Option<String>,

    /// Method sent to the backend for UNLOCK requests [default: UNLOCK].
    #[arg(long, env = "BACKEND_UNLOCK_METHOD")]
    pub backend_unlock_method: Option<String>,

    /// Backend path probed by the readiness endpoint [default: /].
    #[arg(long, env = "BACKEND_READINESS_PROBE_PATH")]
    pub backend_readiness_probe_path: Option<String>,

    /// Request headers never forwarded to the backend.
    #[arg(long, env = "BACKEND_IGNORED_REQUEST_HEADERS", value_delimiter = ',')]
    pub backend_ignored_request_headers: Option<Vec<String>>,

    /// Retries for failed backend requests [default: 0].
    #[arg(long, env = "BACKEND_RETRY_MAX")]
    pub backend_retry_max: Option<u32>,

    /// Maximum accepted request body size in bytes [default: 64 MiB].
    #[arg(long, env = "SERVER_MAX_BODY_BYTES")]
    pub max_body_bytes: Option<usize>,

    /// Log filter used when `RUST_LOG` is not set [default: info].
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(
        long,
        env = "LOG_JSON",
        num_args = 0..=1,
        default_missing_value = "true",
        value_name = "BOOL"
    )]
    pub log_json: Option<bool>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    transform: TransformSection,
    server: ServerSection,
    monitoring: MonitoringSection,
    backend: BackendSection,
    log: LogSection,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct TransformSection {
    age: AgeSection,
    vault: VaultSection,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct AgeSection {
    public_key: Option<String>,
    private_key: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct VaultSection {
    address: Option<String>,
    app_role: AppRoleSection,
    transit: TransitSection,
    token_margin_secs: Option<u64>,
    retry_max: Option<u32>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct AppRoleSection {
    id: Option<String>,
    secret_id: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct TransitSection {
    mount: Option<String>,
    name: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct ServerSection {
    port: Option<u16>,
    max_body_bytes: Option<usize>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct MonitoringSection {
    port: Option<u16>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct BackendSection {
    url: Option<String>,
    lock_method: Option<String>,
    unlock_method: Option<String>,
    readiness_probe: ReadinessSection,
    ignored_request_headers: Option<Vec<String>>,
    retry_max: Option<u32>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct ReadinessSection {
    path: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct LogSection {
    level: Option<String>,
    json: Option<bool>,
}

impl FileConfig {
    /// Parse the file at `path`, or `Ok(None)` if it does not exist.
    fn read(path: &Path) -> Result<Option<Self>, ConfigError> {
        let file_error = |reason: String| ConfigError::File {
            path: path.to_owned(),
            reason,
        };
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(file_error(e.to_string())),
        };
        if text.trim().is_empty() {
            return Ok(Some(Self::default()));
        }
        serde_yaml::from_str(&text)
            .map(Some)
            .map_err(|e| file_error(e.to_string()))
    }
}

impl StartArgs {
    /// Resolve flags, environment and the configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::File`] if the file named by `--config` does not
    /// exist, or if any configuration file cannot be read or parsed.
    pub fn load(self) -> Result<ServerConfig, ConfigError> {
        self.load_with_default(Path::new(DEFAULT_CONFIG_PATH))
    }

    fn load_with_default(self, default_path: &Path) -> Result<ServerConfig, ConfigError> {
        let file = match &self.config_file {
            Some(path) => FileConfig::read(path)?.ok_or_else(|| ConfigError::File {
                path: path.clone(),
                reason: "file not found".to_owned(),
            })?,
            None => FileConfig::read(default_path)?.unwrap_or_default(),
        };
        Ok(self.merge(file))
    }

    fn merge(self, file: FileConfig) -> ServerConfig {
        let FileConfig {
            transform,
            server,
            monitoring,
            backend,
            log,
        } = file;
        let vault = transform.vault;
        let defaults = ServerConfig::default();

        ServerConfig {
            age_public_key: self.age_public_key.or(transform.age.public_key),
            age_private_key: self.age_private_key.or(transform.age.private_key),
            vault_address: self.vault_address.or(vault.address),
            vault_app_role_id: self.vault_app_role_id.or(vault.app_role.id),
            vault_app_role_secret_id: self
                .vault_app_role_secret_id
                .or(vault.app_role.secret_id),
            vault_transit_mount: self
                .vault_transit_mount
                .or(vault.transit.mount)
                .unwrap_or(defaults.vault_transit_mount),
            vault_transit_name: self
                .vault_transit_name
                .or(vault.transit.name)
                .unwrap_or(defaults.vault_transit_name),
            vault_token_margin_secs: self
                .vault_token_margin_secs
                .or(vault.token_margin_secs)
                .unwrap_or(defaults.vault_token_margin_secs),
            vault_retry_max: self
                .vault_retry_max
                .or(vault.retry_max)
                .unwrap_or(defaults.vault_retry_max),
            port: self.port.or(server.port).unwrap_or(defaults.port),
            monitoring_port: self
                .monitoring_port
                .or(monitoring.port)
                .unwrap_or(defaults.monitoring_port),
            backend_url: self.backend_url.or(backend.url),
            backend_lock_method: self
                .backend_lock_method
                .or(backend.lock_method)
                .unwrap_or(defaults.backend_lock_method),
            backend_unlock_method: self
                .backend_unlock_method
                .or(backend.unlock_method)
                .unwrap_or(defaults.backend_unlock_method),
            backend_readiness_probe_path: self
                .backend_readiness_probe_path
                .or(backend.readiness_probe.path)
                .unwrap_or(defaults.backend_readiness_probe_path),
            backend_ignored_request_headers: self
                .backend_ignored_request_headers
                .or(backend.ignored_request_headers)
                .unwrap_or(defaults.backend_ignored_request_headers),
            backend_retry_max: self
                .backend_retry_max
                .or(backend.retry_max)
                .unwrap_or(defaults.backend_retry_max),
            max_body_bytes: self
                .max_body_bytes
                .or(server.max_body_bytes)
                .unwrap_or(defaults.max_body_bytes),
            log_level: self
                .log_level
                .or(log.level)
                .unwrap_or(defaults.log_level),
            log_json: self.log_json.or(log.json).unwrap_or(defaults.log_json),
        }
    }
}

/// Resolved settings for the `start` command.
#[derive(Clone)]
pub struct ServerConfig {
    pub age_public_key: Option<String>,
    pub age_private_key: Option<String>,
    pub vault_address: Option<String>,
    pub vault_app_role_id: Option<String>,
    pub vault_app_role_secret_id: Option<String>,
    pub vault_transit_mount: String,
    pub vault_transit_name: String,
    pub vault_token_margin_secs: u64,
    pub vault_retry_max: u32,
    pub port: u16,
    pub monitoring_port: u16,
    pub backend_url: Option<String>,
    pub backend_lock_method: String,
    pub backend_unlock_method: String,
    pub backend_readiness_probe_path: String,
    pub backend_ignored_request_headers: Vec<String>,
    pub backend_retry_max: u32,
    pub max_body_bytes: usize,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            age_public_key: None,
            age_private_key: None,
            vault_address: None,
            vault_app_role_id: None,
            vault_app_role_secret_id: None,
            vault_transit_mount: "sops".to_owned(),
            vault_transit_name: "terraform".to_owned(),
            vault_token_margin_secs: 60,
            vault_retry_max: DEFAULT_RETRY_MAX,
            port: 8080,
            monitoring_port: 2112,
            backend_url: None,
            backend_lock_method: "LOCK".to_owned(),
            backend_unlock_method: "UNLOCK".to_owned(),
            backend_readiness_probe_path: "/".to_owned(),
            backend_ignored_request_headers: Vec::new(),
            backend_retry_max: 0,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            log_level: "info".to_owned(),
            log_json: false,
        }
    }
}

/// Request handling settings derived from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Backend base URL without a trailing slash.
    pub backend_url: String,
    pub lock_method: Method,
    pub unlock_method: Method,
    pub readiness_path: String,
    pub ignored_request_headers: Vec<HeaderName>,
    pub max_body_bytes: usize,
}

fn present(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

impl ServerConfig {
    /// Check the configuration for errors that make the proxy unusable.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if present(self.age_public_key.as_ref()).is_none() {
            return Err(ConfigError::MissingPublicKey);
        }
        if present(self.backend_url.as_ref()).is_none() {
            return Err(ConfigError::MissingBackendUrl);
        }
        let has_vault = present(self.vault_address.as_ref()).is_some();
        if !has_vault && present(self.age_private_key.as_ref()).is_none() {
            return Err(ConfigError::NoDecryptionKey);
        }
        if has_vault
            && (present(self.vault_app_role_id.as_ref()).is_none()
                || present(self.vault_app_role_secret_id.as_ref()).is_none())
        {
            return Err(ConfigError::MissingAppRole);
        }
        self.proxy_settings().map(|_| ())
    }

    /// Key provider configuration for the transform engine.
    #[must_use]
    pub fn transform_config(&self) -> TransformConfig {
        let transit = present(self.vault_address.as_ref()).map(|address| {
            let mut transit = TransitConfig::new(
                address,
                self.vault_app_role_id.clone().unwrap_or_default(),
                self.vault_app_role_secret_id.clone().unwrap_or_default(),
                self.vault_transit_name.clone(),
            );
            transit.mount.clone_from(&self.vault_transit_mount);
            transit.token_margin = Duration::from_secs(self.vault_token_margin_secs);
            transit.retry_max = self.vault_retry_max;
            transit
        });
        TransformConfig {
            local: LocalKeyConfig {
                public_key: self.age_public_key.clone(),
                private_key: self.age_private_key.clone(),
            },
            transit,
        }
    }

    /// Parse the request handling settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a missing backend URL, an invalid method
    /// name, or an invalid header name.
    pub fn proxy_settings(&self) -> Result<ProxySettings, ConfigError> {
        let backend_url = present(self.backend_url.as_ref())
            .ok_or(ConfigError::MissingBackendUrl)?
            .trim_end_matches('/')
            .to_owned();

        let method = |field: &'static str, value: &str| {
            Method::from_bytes(value.trim().as_bytes()).map_err(|e| ConfigError::Invalid {
                field,
                reason: e.to_string(),
            })
        };

        let ignored_request_headers = self
            .backend_ignored_request_headers
            .iter()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .map(|h| {
                HeaderName::from_bytes(h.as_bytes()).map_err(|e| ConfigError::Invalid {
                    field: "ignored request header",
                    reason: format!("'{h}': {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ProxySettings {
            backend_url,
            lock_method: method("backend lock method", &self.backend_lock_method)?,
            unlock_method: method("backend unlock method", &self.backend_unlock_method)?,
            readiness_path: self.backend_readiness_probe_path.clone(),
            ignored_request_headers,
            max_body_bytes: self.max_body_bytes,
        })
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("ServerConfig")
            .field("age_public_key", &self.age_public_key)
            .field("age_private_key", &redacted(&self.age_private_key))
            .field("vault_address", &self.vault_address)
            .field("vault_app_role_id", &redacted(&self.vault_app_role_id))
            .field(
                "vault_app_role_secret_id",
                &redacted(&self.vault_app_role_secret_id),
            )
            .field("vault_transit_mount", &self.vault_transit_mount)
            .field("vault_transit_name", &self.vault_transit_name)
            .field("vault_token_margin_secs", &self.vault_token_margin_secs)
            .field("vault_retry_max", &self.vault_retry_max)
            .field("port", &self.port)
            .field("monitoring_port", &self.monitoring_port)
            .field("backend_url", &self.backend_url)
            .field("backend_lock_method", &self.backend_lock_method)
            .field("backend_unlock_method", &self.backend_unlock_method)
            .field(
                "backend_readiness_probe_path",
                &self.backend_readiness_probe_path,
            )
            .field(
                "backend_ignored_request_headers",
                &self.backend_ignored_request_headers,
            )
            .field("backend_retry_max", &self.backend_retry_max)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .finish()
    }
}

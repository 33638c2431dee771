//! Configuration loading for sync-client.
//!
//! Configuration is loaded from a TOML file; every field has a default, so
//! an empty file (or [`ClientConfig::default`]) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use inline_sync_core::ConnectionPolicy;
use inline_sync_types::AuthToken;
use serde::{Deserialize, Serialize};

use crate::engine::SyncPolicy;

/// Environment variable overriding [`ClientConfig::realtime_url`].
pub const REALTIME_URL_ENV: &str = "INLINE_REALTIME_URL";

/// Environment variable supplying [`ClientConfig::auth_token`].
pub const TOKEN_ENV: &str = "INLINE_TOKEN";

/// Root configuration for the realtime client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Realtime endpoint (default: wss://api.inline.chat/realtime).
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,
    /// Timeout for RPCs issued through the client (default: 15).
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    /// Bearer token; usually supplied through the environment.
    #[serde(default, skip_serializing)]
    pub auth_token: Option<AuthToken>,
    /// Connection timing.
    #[serde(default)]
    pub connection: ConnectionPolicy,
    /// Sync engine tuning.
    #[serde(default)]
    pub sync: SyncPolicy,
}

fn default_realtime_url() -> String {
    "wss://api.inline.chat/realtime".to_string()
}

fn default_rpc_timeout_secs() -> u64 {
    15
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            realtime_url: default_realtime_url(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            auth_token: None,
            connection: ConnectionPolicy::default(),
            sync: SyncPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            source: e,
        })
    }

    /// Apply `INLINE_REALTIME_URL` and `INLINE_TOKEN` from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let present = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = present(REALTIME_URL_ENV) {
            tracing::debug!("Realtime URL overridden by {}", REALTIME_URL_ENV);
            self.realtime_url = url.trim().to_string();
        }
        if let Some(token) = present(TOKEN_ENV) {
            self.auth_token = Some(AuthToken::new(token.trim()));
        }
        self
    }

    /// Timeout for RPCs issued through the client.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

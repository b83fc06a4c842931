//! Connection and sandbox configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RemoteError;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;
/// Default transport connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Default timeout for the connection to become usable, in milliseconds.
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 20_000;
/// Default interpreter used to run the runner programs.
pub const DEFAULT_NODE_BINARY: &str = "node";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("host is required")]
    MissingHost,
    #[error("username is required")]
    MissingUsername,
    #[error("sandboxPath is required")]
    MissingSandboxPath,
    #[error("one of privateKey, privateKeyPath or password is required")]
    MissingCredentials,
    #[error("private key file not found: {0}")]
    KeyFileNotFound(PathBuf),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ConfigError> for RemoteError {
    fn from(err: ConfigError) -> Self {
        Self::validation(err.to_string())
    }
}

/// User-facing configuration, as loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    /// Private key content.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub password: Option<String>,
    /// Remote directory calls are resolved against.
    pub sandbox_path: String,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub ready_timeout_ms: Option<u64>,
    /// Command run inside the sandbox right after connecting.
    #[serde(default)]
    pub prebuild_command: Option<String>,
    #[serde(default)]
    pub stream_logs: Option<bool>,
    #[serde(default)]
    pub node_binary: Option<String>,
}

/// How the transport authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    KeyContent(String),
    KeyFile(PathBuf),
    Password(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyContent(_) => f.write_str("KeyContent(<redacted>)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Configuration with defaults applied and invariants checked.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub sandbox_path: String,
    pub connect_timeout: Duration,
    pub ready_timeout: Duration,
    pub prebuild_command: Option<String>,
    pub stream_logs: bool,
    pub node_binary: String,
}

impl SandboxConfig {
    /// Parse a configuration from JSON text.
    ///
    /// # Errors
    /// Returns error if the JSON does not match the configuration shape.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Apply defaults and check required fields.
    ///
    /// # Errors
    /// Returns error if a required field is missing, no credential form is
    /// present, or the key file does not exist.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::MissingUsername);
        }
        if self.sandbox_path.trim().is_empty() {
            return Err(ConfigError::MissingSandboxPath);
        }

        let credentials = self.resolve_credentials()?;

        Ok(ValidatedConfig {
            host: self.host.trim().to_string(),
            port: self.port.unwrap_or(DEFAULT_PORT),
            username: self.username.trim().to_string(),
            credentials,
            sandbox_path: self.sandbox_path.trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_millis(
                self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            ready_timeout: Duration::from_millis(
                self.ready_timeout_ms.unwrap_or(DEFAULT_READY_TIMEOUT_MS),
            ),
            prebuild_command: self
                .prebuild_command
                .as_ref()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            stream_logs: self.stream_logs.unwrap_or(false),
            node_binary: self
                .node_binary
                .clone()
                .unwrap_or_else(|| DEFAULT_NODE_BINARY.to_string()),
        })
    }

    fn resolve_credentials(&self) -> Result<Credentials, ConfigError> {
        if let Some(key) = self.private_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(Credentials::KeyContent(key.clone()));
        }
        if let Some(path) = &self.private_key_path {
            let expanded = expand_home(path);
            if !expanded.is_file() {
                return Err(ConfigError::KeyFileNotFound(expanded));
            }
            return Ok(Credentials::KeyFile(expanded));
        }
        if let Some(password) = self.password.as_ref().filter(|p| !p.is_empty()) {
            return Ok(Credentials::Password(password.clone()));
        }
        Err(ConfigError::MissingCredentials)
    }
}

/// Expand a leading `~` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map_or_else(|| path.to_path_buf(), |home| home.join(rest)),
        Err(_) => path.to_path_buf(),
    }
}

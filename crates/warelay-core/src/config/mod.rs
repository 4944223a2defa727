mod defaults;


use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::RelayError;
use defaults::*;

/// Top-level warelay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

/// General process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Root for session credentials and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Also write logs to `{data_dir}/logs/warelay.log`.
    #[serde(default)]
    pub log_file: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_file: false,
        }
    }
}

/// Which endpoint set the server exposes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Per-caller instances provisioned over HTTP.
    #[default]
    Multi,
    /// One implicit session started with the process; only `POST /send`.
    Single,
}

impl ServerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Multi => "multi",
            Self::Single => "single",
        }
    }
}

impl std::str::FromStr for ServerMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multi" => Ok(Self::Multi),
            "single" => Ok(Self::Single),
            other => Err(RelayError::Config(format!(
                "invalid mode '{other}', expected 'multi' or 'single'"
            ))),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret every request must present. Empty = server refuses to start.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub mode: ServerMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: String::new(),
            mode: ServerMode::default(),
        }
    }
}

/// Session registry and messaging client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Concurrent session ceiling.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_logout_timeout")]
    pub logout_timeout_secs: u64,
    /// Name shown under "Linked devices" on the phone.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Identity of the implicit session in single-instance mode.
    #[serde(default = "default_identity")]
    pub default_identity: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            init_timeout_secs: default_init_timeout(),
            send_timeout_secs: default_send_timeout(),
            logout_timeout_secs: default_logout_timeout(),
            device_name: default_device_name(),
            default_identity: default_identity(),
        }
    }
}

impl SessionsConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn logout_timeout(&self) -> Duration {
        Duration::from_secs(self.logout_timeout_secs)
    }
}

impl Config {
    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.server.api_key.is_empty() {
            return Err(RelayError::Config(
                "api_key is empty. Set it in config.toml or the API_KEY env var.".into(),
            ));
        }
        if self.sessions.max_instances == 0 {
            return Err(RelayError::Config(
                "sessions.max_instances must be at least 1".into(),
            ));
        }
        if self.sessions.default_identity.trim().is_empty() {
            return Err(RelayError::Config(
                "sessions.default_identity must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, RelayError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    parse(&content)
}

/// Parse configuration from TOML text.
pub fn parse(content: &str) -> Result<Config, RelayError> {
    toml::from_str(content).map_err(|e| RelayError::Config(format!("failed to parse config: {e}")))
}

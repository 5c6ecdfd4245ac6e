use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionLimits;
use crate::frame::MAX_CONTROL_PAYLOAD;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Server settings, loaded from a TOML file. Every field is optional.
///
/// ```toml
/// bind = "127.0.0.1:9001"
/// stale_after_secs = 60
/// allowed_origins = ["https://example.com"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub handshake_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub stale_after_secs: u64,
    /// Sweep and heartbeat period.
    pub sweep_interval_secs: u64,
    pub max_frame_size: usize,
    pub max_message_size: usize,
    pub max_handshake_bytes: usize,
    /// Empty accepts any origin.
    pub allowed_origins: Vec<String>,
    /// Query parameter that carries the client identifier.
    pub client_id_param: String,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            handshake_timeout_ms: 10_000,
            close_timeout_ms: 5_000,
            stale_after_secs: 90,
            sweep_interval_secs: 30,
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 16 * 1024 * 1024,
            max_handshake_bytes: 8 * 1024,
            allowed_origins: Vec::new(),
            client_id_param: "clientId".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<ServerConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse and validate a config from TOML text.
    pub fn from_str(content: &str) -> Result<ServerConfig, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("close_timeout_ms", self.close_timeout_ms),
            ("stale_after_secs", self.stale_after_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        for (name, value) in [
            ("max_frame_size", self.max_frame_size),
            ("max_message_size", self.max_message_size),
        ] {
            if value < MAX_CONTROL_PAYLOAD {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at least {MAX_CONTROL_PAYLOAD} bytes"
                )));
            }
        }
        // Room for a request line plus the four required headers.
        if self.max_handshake_bytes < 256 {
            return Err(ConfigError::Invalid(
                "max_handshake_bytes must be at least 256".to_string(),
            ));
        }
        if self.client_id_param.is_empty() {
            return Err(ConfigError::Invalid("client_id_param must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_frame_size: self.max_frame_size,
            max_message_size: self.max_message_size,
            stale_after: Duration::from_secs(self.stale_after_secs),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }
}

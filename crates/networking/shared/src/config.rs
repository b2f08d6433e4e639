//! Konfiguration des Server-Sockets.
//!
//! Loaded from TOML; every field is optional and falls back to the defaults below.
//!
//! ```toml
//! address = "127.0.0.1"
//! port = 7770
//! maximum_clients = 64
//! peer_to_peer = false
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MAX_MESSAGES_PER_POLL;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSocketConfig {
    /// Bind address for direct-IP mode. Empty means "any". Ignored in peer-to-peer mode.
    pub address: String,
    pub port: u16,
    pub maximum_clients: u32,
    /// Listen on the relay network instead of a direct IP socket.
    pub peer_to_peer: bool,
    /// Maximum messages pulled per remote peer and tick.
    pub receive_batch_size: usize,
    /// Network ticks per second used by hosts driving the socket.
    pub tick_rate: f64,
}

impl Default for ServerSocketConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 7770,
            maximum_clients: 4095,
            peer_to_peer: false,
            receive_batch_size: MAX_MESSAGES_PER_POLL,
            tick_rate: 30.0,
        }
    }
}

impl ServerSocketConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!("loaded server socket config from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.receive_batch_size == 0 {
            return Err(ConfigError::Invalid("receive_batch_size must be at least 1"));
        }
        if !(self.tick_rate.is_finite() && self.tick_rate > 0.0) {
            return Err(ConfigError::Invalid("tick_rate must be a positive number"));
        }
        Ok(())
    }
}

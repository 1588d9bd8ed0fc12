//! Server configuration.
//!
//! Defaults suit local development; `from_env` applies overrides:
//!
//! | variable | effect |
//! |----------|--------|
//! | `COLLAB_BIND_ADDR` | listen address, e.g. `0.0.0.0:4001` |
//! | `PORT` | shorthand for `0.0.0.0:<PORT>` when `COLLAB_BIND_ADDR` is unset |
//! | `COLLAB_PATH` | WebSocket endpoint path |
//! | `COLLAB_STORAGE_PATH` | RocksDB directory (unset = in-memory) |
//! | `COLLAB_SAVE_INTERVAL_MS` | write-back debounce interval |

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path the WebSocket upgrade must target
    pub path: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Minimum spacing between two writes of the same document
    pub save_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4001".to_string(),
            path: "/collaboration".to_string(),
            storage_path: None,
            save_interval: Duration::from_millis(1000),
        }
    }
}

impl ServerConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("COLLAB_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: "PORT",
                value: port.clone(),
            })?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }

        if let Some(path) = lookup("COLLAB_PATH") {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue { var: "COLLAB_PATH", value: path });
            }
            config.path = path;
        }

        if let Some(dir) = lookup("COLLAB_STORAGE_PATH") {
            if !dir.is_empty() {
                config.storage_path = Some(PathBuf::from(dir));
            }
        }

        if let Some(ms) = lookup("COLLAB_SAVE_INTERVAL_MS") {
            let parsed: u64 = ms.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: "COLLAB_SAVE_INTERVAL_MS",
                value: ms.clone(),
            })?;
            if parsed == 0 {
                return Err(ConfigError::InvalidValue { var: "COLLAB_SAVE_INTERVAL_MS", value: ms });
            }
            config.save_interval = Duration::from_millis(parsed);
        }

        Ok(config)
    }
}

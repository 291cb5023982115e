//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/brook/config.toml` by default. Every field has a sensible
//! default, so a missing file is not an error.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a brook client context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address: a Unix socket path (leading `/`) or `host[:port]`.
    /// Overridden by an explicit `connect()` argument or `$BROOK_SERVER`.
    pub server: Option<String>,

    /// Path of the auth cookie file. Defaults to `~/.config/brook/cookie`.
    pub cookie_path: Option<PathBuf>,

    /// Seconds to wait for the transport connection to establish.
    pub connect_timeout_secs: u64,

    /// Seconds to wait for each request's reply before it times out.
    pub reply_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            cookie_path: None,
            connect_timeout_secs: 30,
            reply_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    /// Default config file location: `~/.config/brook/config.toml`.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("brook")
            .join("config.toml")
    }

    /// Loads the config from the default location; a missing file yields
    /// the defaults.
    pub fn load() -> Result<Self, String> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Loads the config from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&contents).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

/// Default server socket path: `$XDG_RUNTIME_DIR/brook/native`.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("brook")
        .join("native")
}

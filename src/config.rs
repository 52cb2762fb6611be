//! Configuration loading and persistence.
//!
//! Reads `config.json` from the chatwire config directory, falls back to
//! defaults, then applies `CHATWIRE_*` environment overrides. The bearer
//! token is never part of this file; see [`crate::credentials`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};

use crate::backoff::BackoffPolicy;
use crate::constants;

/// Name of the config file inside the config directory.
const CONFIG_FILE: &str = "config.json";

/// Top-level configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the chat server (`https://…`).
    pub server_url: String,
    /// Socket channel settings.
    pub socket: SocketConfig,
    /// Stream channel settings.
    pub stream: StreamConfig,
}

/// Socket channel section.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SocketConfig {
    /// Path of the negotiation and socket endpoint.
    pub path: String,
    /// Bound on negotiation plus socket open, in seconds.
    pub handshake_timeout_secs: u64,
    /// First reconnect delay, in milliseconds.
    pub backoff_base_ms: u64,
    /// Largest reconnect delay, in milliseconds.
    pub backoff_cap_ms: u64,
    /// Random spread added to each delay (still capped), in milliseconds.
    pub jitter_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Room joined right after authenticating.
    pub default_room: String,
}

/// Stream channel section.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    /// Path of the event stream endpoint.
    pub path: String,
    /// Unit reconnect delay, in seconds.
    pub reconnect_interval_secs: u64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: constants::DEFAULT_SERVER_URL.to_string(),
            socket: SocketConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: constants::DEFAULT_SOCKET_PATH.to_string(),
            handshake_timeout_secs: constants::HANDSHAKE_TIMEOUT.as_secs(),
            backoff_base_ms: constants::SOCKET_BACKOFF_BASE.as_millis() as u64,
            backoff_cap_ms: constants::SOCKET_BACKOFF_CAP.as_millis() as u64,
            jitter_ms: 0,
            max_reconnect_attempts: constants::SOCKET_MAX_RECONNECT_ATTEMPTS,
            default_room: constants::DEFAULT_ROOM.to_string(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            path: constants::DEFAULT_STREAM_PATH.to_string(),
            reconnect_interval_secs: constants::STREAM_RECONNECT_INTERVAL.as_secs(),
            max_reconnect_attempts: constants::STREAM_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl SocketConfig {
    /// Handshake bound as a `Duration`.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Exponential policy built from the base and cap.
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    /// Jitter as a `Duration`.
    #[must_use]
    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

impl StreamConfig {
    /// Unit reconnect delay as a `Duration`.
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

impl Config {
    /// Get the chatwire config directory, creating it if needed.
    ///
    /// `CHATWIRE_CONFIG_DIR` overrides the platform config dir
    /// (macOS: ~/Library/Application Support/chatwire).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CHATWIRE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("chatwire")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Load from the config directory, then apply environment overrides.
    ///
    /// A missing file yields defaults. A file that exists but does not parse
    /// is an error rather than a silent reset.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `config.json` from `dir` without environment overrides.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            log::debug!("No config at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Apply `CHATWIRE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("CHATWIRE_SERVER_URL") {
            self.server_url = server_url;
        }
        if let Some(path) = lookup("CHATWIRE_SOCKET_PATH") {
            self.socket.path = path;
        }
        if let Some(path) = lookup("CHATWIRE_STREAM_PATH") {
            self.stream.path = path;
        }
        if let Some(room) = lookup("CHATWIRE_DEFAULT_ROOM") {
            self.socket.default_room = room;
        }

        if let Some(secs) = parse_var(&lookup, "CHATWIRE_HANDSHAKE_TIMEOUT") {
            self.socket.handshake_timeout_secs = secs;
        }
        if let Some(max) = parse_var(&lookup, "CHATWIRE_SOCKET_MAX_ATTEMPTS") {
            self.socket.max_reconnect_attempts = max;
        }
        if let Some(secs) = parse_var(&lookup, "CHATWIRE_STREAM_INTERVAL") {
            self.stream.reconnect_interval_secs = secs;
        }
        if let Some(max) = parse_var(&lookup, "CHATWIRE_STREAM_MAX_ATTEMPTS") {
            self.stream.max_reconnect_attempts = max;
        }
    }

    /// Persist to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persist to `dir/config.json` with owner-only permissions.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Full URL of the event stream endpoint.
    #[must_use]
    pub fn stream_url(&self) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), self.stream.path)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}

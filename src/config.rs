//! Client configuration
//!
//! Settings can be built in code (see [`crate::client::HsClientBuilder`]) or
//! loaded from a TOML file.
//!
//! ## Environment Variables
//!
//! The following environment variables override file settings:
//!
//! - `HS_HOST` - Server host
//! - `HS_PORT` - Server port
//! - `HS_POOL_SIZE` - Number of persistent sessions
//! - `HS_AUTH_KEY` - Key sent with the auth request on every connect
//!
//! These can also be set in a `.env` file next to the configuration file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HsError, HsResult};
use crate::protocol::MAX_FRAME_SIZE;
use crate::supervisor::BackoffPolicy;

pub const ENV_HOST: &str = "HS_HOST";
pub const ENV_PORT: &str = "HS_PORT";
pub const ENV_POOL_SIZE: &str = "HS_POOL_SIZE";
pub const ENV_AUTH_KEY: &str = "HS_AUTH_KEY";

/// Default read/write port of the HandlerSocket plugin
pub const DEFAULT_PORT: u16 = 9999;
pub const DEFAULT_POOL_SIZE: usize = 1;

/// How the pool picks a session for each operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    /// Fewest requests in flight wins
    LeastPending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-request wait limit; unset waits for as long as the session lives
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// How long an operation waits for a Ready session; unset fails fast
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: Option<u64>,
    #[serde(default)]
    pub selection: SelectionPolicy,
    #[serde(default)]
    pub auth_key: Option<String>,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_acquire_timeout_ms() -> Option<u64> {
    Some(5_000)
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

impl ClientConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            selection: SelectionPolicy::default(),
            backoff: BackoffPolicy::default(),
            auth_key: None,
            max_frame_size: default_max_frame_size(),
        }
    }

    /// Load a TOML file, then apply `.env` and environment overrides
    pub fn load(path: &Path) -> HsResult<Self> {
        if let Some(dir) = path.parent() {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
            }
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            HsError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> HsResult<Self> {
        toml::from_str(content).map_err(|e| HsError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> HsResult<String> {
        toml::to_string_pretty(self).map_err(|e| HsError::Config(e.to_string()))
    }

    /// Overwrite fields from `HS_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var(ENV_HOST) {
            if !host.is_empty() {
                self.host = host;
            }
        }

        if let Ok(port) = std::env::var(ENV_PORT) {
            if let Ok(port) = port.parse::<u16>() {
                self.port = port;
            }
        }

        if let Ok(size) = std::env::var(ENV_POOL_SIZE) {
            if let Ok(size) = size.parse::<usize>() {
                self.pool_size = size;
            }
        }

        if let Ok(key) = std::env::var(ENV_AUTH_KEY) {
            if !key.is_empty() {
                self.auth_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> HsResult<()> {
        if self.host.is_empty() {
            return Err(HsError::Config("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(HsError::Config("port must not be zero".to_string()));
        }
        if self.pool_size == 0 {
            return Err(HsError::Config("pool size must be at least 1".to_string()));
        }
        if self.max_frame_size == 0 {
            return Err(HsError::Config("max frame size must not be zero".to_string()));
        }
        self.backoff.validate()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

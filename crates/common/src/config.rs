//! Agent configuration loader using TOML and serde.
//!
//! Two sources, in increasing precedence: a TOML file and `SLATE_*`
//! environment variables. The struct is intentionally small and typed;
//! every field has a production default so a bare `AgentConfig::default()`
//! is a runnable configuration (with no controllers to talk to).

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;

/// Errors from loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Node identifier. `None` lets the hosting process generate one.
    pub node_id: Option<String>,

    /// Controller endpoint base URLs, e.g. `http://controller-0:9860`.
    pub controller_endpoints: Vec<String>,

    /// Heartbeat interval in milliseconds. Also the per-cycle timeout
    /// budget for each endpoint exchange.
    pub heartbeat_interval_ms: u64,

    /// Replication supervisor worker pool size.
    pub replication_workers: usize,

    /// Worker pool size for container deletion commands.
    pub container_delete_workers: usize,

    /// Worker pool size for block deletion commands.
    pub block_delete_workers: usize,

    /// Maximum queued block-deletion commands before new ones are refused.
    pub block_delete_queue_limit: usize,

    /// Number of failed storage volumes tolerated before the agent asks
    /// the hosting process to stop.
    pub failed_volumes_tolerated: u64,

    /// Directory holding the layout-version marker. Owned by the storage
    /// layer; passed through to whatever `LayoutVersionStore` the hosting
    /// process builds.
    pub layout_dir: Option<PathBuf>,

    /// Port for the read-only observability endpoint. `None` disables it.
    pub http_port: Option<u16>,

    /// Grace period granted to in-flight work during shutdown before
    /// forced cancellation, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            node_id: None,
            controller_endpoints: Vec::new(),
            heartbeat_interval_ms: 30_000,
            replication_workers: 10,
            container_delete_workers: 2,
            block_delete_workers: 5,
            block_delete_queue_limit: 60,
            failed_volumes_tolerated: 0,
            layout_dir: None,
            http_port: None,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: AgentConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build entirely from environment variables on top of defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = AgentConfig::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay `SLATE_*` environment variables onto this config.
    /// Unparseable numeric values are ignored rather than fatal; the
    /// validated file value (or default) stays in effect.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("SLATE_NODE_ID") {
            if !v.is_empty() {
                self.node_id = Some(v);
            }
        }
        if let Ok(v) = env::var("SLATE_CONTROLLERS") {
            let endpoints: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !endpoints.is_empty() {
                self.controller_endpoints = endpoints;
            }
        }
        if let Ok(v) = env::var("SLATE_HEARTBEAT_MS") {
            if let Ok(ms) = v.parse() {
                self.heartbeat_interval_ms = ms;
            }
        }
        if let Ok(v) = env::var("SLATE_HTTP_PORT") {
            if let Ok(port) = v.parse() {
                self.http_port = Some(port);
            }
        }
        if let Ok(v) = env::var("SLATE_LAYOUT_DIR") {
            if !v.is_empty() {
                self.layout_dir = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = env::var("SLATE_FAILED_VOLUMES_TOLERATED") {
            if let Ok(n) = v.parse() {
                self.failed_volumes_tolerated = n;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.replication_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "replication_workers",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.block_delete_workers == 0 || self.container_delete_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "command workers",
                reason: "per-command worker pools must be non-empty".to_string(),
            });
        }
        Ok(())
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::home::CommanderHome;

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RECONCILE_CACHE_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid config {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommanderConfig {
    /// Repository whose `runs/` directory holds the run worktrees.
    pub harness_root: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub reconcile_cache_secs: Option<u64>,
}

impl CommanderConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(
            self.heartbeat_interval_secs
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
        )
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(
            self.heartbeat_timeout_secs
                .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
        )
    }

    /// A timeout no longer than the interval would let a healthy controller
    /// look stale between two beats.
    pub fn validate(&self) -> Result<(), String> {
        let interval = self.heartbeat_interval();
        let timeout = self.heartbeat_timeout();
        if timeout <= interval {
            return Err(format!(
                "heartbeat_timeout_secs ({}) must be greater than heartbeat_interval_secs ({})",
                timeout.as_secs(),
                interval.as_secs()
            ));
        }
        Ok(())
    }

    pub fn reconcile_cache(&self) -> Duration {
        Duration::from_secs(
            self.reconcile_cache_secs
                .unwrap_or(DEFAULT_RECONCILE_CACHE_SECS),
        )
    }
}

/// Missing file means defaults; a file that exists but does not parse is an error.
pub fn load_config(home: &CommanderHome) -> Result<CommanderConfig, ConfigError> {
    let path = home.config_path();
    if !path.is_file() {
        return Ok(CommanderConfig::default());
    }
    let text = fs::read_to_string(&path)?;
    let config = toml::from_str::<CommanderConfig>(&text)
        .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
    config
        .validate()
        .map_err(|message| ConfigError::Invalid { path, message })?;
    Ok(config)
}

/// Resolve the backend root: explicit flag, then config, then the current directory.
pub fn resolve_harness_root_with_source(
    explicit: Option<&Path>,
    config: &CommanderConfig,
) -> (PathBuf, &'static str) {
    if let Some(path) = explicit {
        return (path.to_path_buf(), "flag");
    }
    if let Some(value) = config
        .harness_root
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return (PathBuf::from(value), "config");
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    (cwd, "default")
}

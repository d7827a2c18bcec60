//! Configuration file for the shardline CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Defaults read from `~/.shardline/config.toml`. Command-line flags and
/// environment variables take precedence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Redis URL holding leases and checkpoints
    pub redis_url: Option<String>,

    /// Key prefix shared with the consuming fleet
    pub redis_prefix: String,

    /// AWS region
    pub region: Option<String>,

    /// Custom Kinesis endpoint (e.g. LocalStack)
    pub endpoint_url: Option<String>,

    /// Color fault lines on stderr
    pub colored: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_prefix: "shardline".to_string(),
            region: None,
            endpoint_url: None,
            colored: true,
        }
    }
}

impl Config {
    /// Load config from the default location, or defaults if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Get config file path (~/.shardline/config.toml)
    fn config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".shardline").join("config.toml")
    }
}

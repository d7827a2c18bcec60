//! Subcommand handlers

pub mod checkpoints;
pub mod tail;

use crate::config::Config;

/// Connection settings after merging flags, environment and the config file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub colored: bool,
}

impl Settings {
    pub fn resolve(
        config: Config,
        redis_url: Option<String>,
        redis_prefix: Option<String>,
        region: Option<String>,
    ) -> Self {
        Self {
            redis_url: redis_url.or(config.redis_url),
            redis_prefix: redis_prefix.unwrap_or(config.redis_prefix),
            region: region.or(config.region),
            endpoint_url: config.endpoint_url,
            colored: config.colored,
        }
    }
}

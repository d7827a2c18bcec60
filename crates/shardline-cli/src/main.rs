//! shardline CLI
//!
//! Command-line companion for shardline consumers.
//!
//! ## Quick Start
//!
//! ```bash
//! # Print every payload of a stream, one per line
//! shardline tail --stream orders
//!
//! # Replay the last hour, then follow
//! shardline t -s orders -d 1h
//!
//! # Start where a consuming fleet left off, without disturbing it
//! shardline tail -s orders --redis-url redis://localhost:6379 --redis-prefix orders-app
//!
//! # Inspect the fleet's stored checkpoints
//! shardline checkpoints --redis-url redis://localhost:6379 --redis-prefix orders-app
//! ```
//!
//! ## Configuration
//!
//! Flags fall back to environment variables (`SHARDLINE_STREAM`,
//! `SHARDLINE_REDIS_URL`, `SHARDLINE_REDIS_PREFIX`, `AWS_REGION`) and then to
//! `~/.shardline/config.toml`. Logs go to stderr (`RUST_LOG`, default `info`);
//! stdout carries only payloads.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;
mod format;

use commands::Settings;
use config::Config;

#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Partitioned stream consumer tools", long_about = None)]
struct Cli {
    /// Redis URL for leases and checkpoints
    #[arg(long, global = true, env = "SHARDLINE_REDIS_URL")]
    redis_url: Option<String>,

    /// Key prefix shared with the consuming fleet
    #[arg(long, global = true, env = "SHARDLINE_REDIS_PREFIX")]
    redis_prefix: Option<String>,

    /// AWS region
    #[arg(long, global = true, env = "AWS_REGION")]
    region: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every record of a stream to stdout
    #[command(visible_alias = "t")]
    Tail {
        /// Stream name
        #[arg(short, long, env = "SHARDLINE_STREAM")]
        stream: String,
        /// Replay records newer than this (e.g. 30m, 2h) for partitions without a checkpoint
        #[arg(short, long)]
        duration: Option<humantime::Duration>,
    },
    /// Print stored checkpoints
    Checkpoints,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::resolve(Config::load()?, cli.redis_url, cli.redis_prefix, cli.region);

    match cli.command {
        Commands::Tail { stream, duration } => {
            commands::tail::handle_tail(stream, duration.map(Into::into), &settings).await?
        }
        Commands::Checkpoints => commands::checkpoints::handle_checkpoints(&settings).await?,
    }

    Ok(())
}

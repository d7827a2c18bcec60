//! `shardline checkpoints`: print the stored head of every partition

use super::Settings;
use crate::format::checkpoint_lines;
use anyhow::{Context, Result};
use shardline_store::{sequence_key, KvStore, RedisKvStore};

pub async fn handle_checkpoints(settings: &Settings) -> Result<()> {
    let url = settings
        .redis_url
        .as_deref()
        .context("No Redis URL configured (use --redis-url or SHARDLINE_REDIS_URL)")?;

    let store = RedisKvStore::connect(url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {url}"))?;
    let key = sequence_key(&settings.redis_prefix);
    let heads = store
        .hgetall(&key)
        .await
        .with_context(|| format!("Failed to read {key}"))?;

    if heads.is_empty() {
        println!("No checkpoints under {key}");
        return Ok(());
    }

    println!("Checkpoints ({}):", heads.len());
    for line in checkpoint_lines(&heads) {
        println!("  {line}");
    }
    Ok(())
}

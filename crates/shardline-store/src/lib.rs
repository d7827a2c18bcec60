//! Key-value store for shardline leases and checkpoints
//!
//! Leases and checkpoint heads live in a shared store that speaks the Redis
//! command set. Two key families are used under a caller-chosen prefix:
//!
//! ```text
//! <prefix>:lock:<partition>   string   lease token, expires after the lease TTL
//! <prefix>:sequence           hash     partition -> last acknowledged cursor
//! ```
//!
//! The [`KvStore`] trait exposes exactly the commands leases and checkpoints
//! need, so any backend honouring their Redis semantics can be swapped in.
//!
//! ## Backends
//!
//! - [`RedisKvStore`]: a multiplexed Redis connection
//! - [`MemoryKvStore`]: in-process map with TTLs, command counting and fault injection

pub mod error;
pub mod memory;
pub mod redis_store;

pub use error::{Result, StoreError};
pub use memory::MemoryKvStore;
pub use redis_store::RedisKvStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Key holding the lease token for one partition.
pub fn lock_key(prefix: &str, partition_id: &str) -> String {
    format!("{prefix}:lock:{partition_id}")
}

/// Key of the hash holding every partition's checkpoint.
pub fn sequence_key(prefix: &str) -> String {
    format!("{prefix}:sequence")
}

/// Condition flag for `PEXPIRE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireCondition {
    /// No flag: always set the expiry.
    Always,
    /// `NX`: only when the key has no expiry yet.
    IfNoExpiry,
    /// `XX`: only when the key already has an expiry.
    IfHasExpiry,
}

impl ExpireCondition {
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            ExpireCondition::Always => None,
            ExpireCondition::IfNoExpiry => Some("NX"),
            ExpireCondition::IfHasExpiry => Some("XX"),
        }
    }
}

/// Millisecond TTL as sent on the wire. Redis rejects `PX 0`.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// The store commands used for leases and checkpoints.
///
/// ## Thread Safety
///
/// Implementations must be Send + Sync; leases, checkpointers and pollers
/// share one store through `Arc<dyn KvStore>`. Each call is one round trip
/// and implementations must not hold a connection between calls.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `SET key value PX ttl NX`.
    ///
    /// Returns `true` when the server replied `OK`, `false` when the key
    /// already existed.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// `PEXPIRE key ttl [NX|XX]`.
    ///
    /// Returns `true` when the expiry was set, `false` when the key does not
    /// exist or the condition was not met.
    async fn pexpire(&self, key: &str, ttl: Duration, condition: ExpireCondition) -> Result<bool>;

    /// `GET key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `DEL key`. Returns `true` when a key was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// `HGETALL key`. A missing key yields an empty map.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// `HMSET key f1 v1 f2 v2 ...`. An empty map is a no-op.
    async fn hmset(&self, key: &str, fields: &HashMap<String, String>) -> Result<()>;
}

//! Lease Manager - Partition Ownership
//!
//! A lease is a key `<prefix>:lock:<partition>` whose value is this process's
//! token and whose TTL bounds how long a crashed owner blocks the partition.
//!
//! ## How It Works
//!
//! 1. **Acquire**: `SET key token PX ttl NX`. Exactly one process wins.
//! 2. **Heartbeat**: pollers call [`LeaseManager::heartbeat`] every cycle. It is
//!    a leaky bucket: if less than half the TTL has passed since the last
//!    successful heartbeat it returns without touching the store. Otherwise it
//!    checks the token with `GET` and extends the TTL with `PEXPIRE`, falling
//!    back to a fresh `SET NX` if the key vanished.
//! 3. **Release**: `GET` + compare token, then `DEL`. A foreign token is never
//!    deleted.
//!
//! The held set and heartbeat timestamps sit behind short-lived locks that are
//! never held across a store round trip.
//!
//! ## Example
//!
//! ```rust,no_run
//! use shardline_consumer::{LeaseManager, Provisioner};
//! use shardline_store::MemoryKvStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let leases = LeaseManager::new(Arc::new(MemoryKvStore::new()), "app", Duration::from_secs(30));
//! leases.try_acquire("shard-0").await?;
//! leases.heartbeat("shard-0").await?;
//! leases.release("shard-0").await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{LeaseError, LeaseResult};
use async_trait::async_trait;
use shardline_store::{lock_key, ExpireCondition, KvStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Partition ownership as seen by pollers and the consumer.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Claim a partition. Fails if this process or another one holds it.
    async fn try_acquire(&self, partition_id: &str) -> LeaseResult<()>;

    /// Give a partition up. Fails with `BadLock` if the lease is not ours.
    async fn release(&self, partition_id: &str) -> LeaseResult<()>;

    /// Keep a held partition alive. Cheap to call on every poll cycle.
    async fn heartbeat(&self, partition_id: &str) -> LeaseResult<()>;

    fn ttl(&self) -> Duration;
}

/// Standalone lease manager over a [`KvStore`].
pub struct LeaseManager {
    store: Arc<dyn KvStore>,
    prefix: String,
    ttl: Duration,
    token: String,
    held: Mutex<HashSet<String>>,
    heartbeats: Mutex<HashMap<String, Instant>>,
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LeaseManager {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        let token = uuid::Uuid::new_v4().to_string();
        let prefix = prefix.into();
        info!(prefix = %prefix, ttl_ms = ttl.as_millis() as u64, "Lease manager created");
        Self {
            store,
            prefix,
            ttl,
            token,
            held: Mutex::new(HashSet::new()),
            heartbeats: Mutex::new(HashMap::new()),
        }
    }

    /// Token proving ownership of this manager's leases.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Partitions this manager currently believes it holds.
    pub fn held_partitions(&self) -> Vec<String> {
        let mut held: Vec<String> = guard(&self.held).iter().cloned().collect();
        held.sort();
        held
    }

    pub fn is_held(&self, partition_id: &str) -> bool {
        guard(&self.held).contains(partition_id)
    }

    /// `SET NX PX` without consulting the local held set.
    pub(crate) async fn acquire_in_store(&self, partition_id: &str) -> LeaseResult<()> {
        let key = lock_key(&self.prefix, partition_id);
        if self.store.set_nx_px(&key, &self.token, self.ttl).await? {
            guard(&self.held).insert(partition_id.to_string());
            debug!(partition_id = %partition_id, "Lease acquired");
            Ok(())
        } else {
            Err(LeaseError::AcquireFailed(partition_id.to_string()))
        }
    }

    /// Drop a partition from the held set without touching the store.
    pub(crate) fn forget(&self, partition_id: &str) {
        guard(&self.held).remove(partition_id);
        guard(&self.heartbeats).remove(partition_id);
    }

    /// Whether enough of the TTL has elapsed since the last heartbeat to renew.
    fn heartbeat_due(&self, partition_id: &str, now: Instant) -> bool {
        match guard(&self.heartbeats).get(partition_id) {
            Some(last) => now.saturating_duration_since(*last) * 2 >= self.ttl,
            None => true,
        }
    }
}

#[async_trait]
impl Provisioner for LeaseManager {
    async fn try_acquire(&self, partition_id: &str) -> LeaseResult<()> {
        if self.is_held(partition_id) {
            return Err(LeaseError::AlreadyHeldLocally(partition_id.to_string()));
        }
        self.acquire_in_store(partition_id).await
    }

    async fn release(&self, partition_id: &str) -> LeaseResult<()> {
        self.forget(partition_id);

        let key = lock_key(&self.prefix, partition_id);
        match self.store.get(&key).await? {
            Some(value) if value == self.token => {
                self.store.del(&key).await?;
                debug!(partition_id = %partition_id, "Lease released");
                Ok(())
            }
            _ => Err(LeaseError::BadLock(partition_id.to_string())),
        }
    }

    async fn heartbeat(&self, partition_id: &str) -> LeaseResult<()> {
        let now = Instant::now();
        if !self.heartbeat_due(partition_id, now) {
            return Ok(());
        }

        let key = lock_key(&self.prefix, partition_id);
        match self.store.get(&key).await? {
            Some(value) if value != self.token => {
                return Err(LeaseError::LockChanged(partition_id.to_string()));
            }
            _ => {}
        }

        let extended = match self
            .store
            .pexpire(&key, self.ttl, ExpireCondition::Always)
            .await
        {
            Ok(extended) => extended,
            Err(e) => {
                warn!(partition_id = %partition_id, error = %e, "Lease extension failed");
                false
            }
        };
        if !extended {
            self.acquire_in_store(partition_id).await?;
        }

        guard(&self.heartbeats).insert(partition_id.to_string(), now);
        debug!(partition_id = %partition_id, "Lease heartbeat");
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

//! In-memory backend
//!
//! Reproduces the Redis semantics that leases and checkpoints depend on:
//! key expiry (on `tokio::time`, so paused-clock tests can advance it),
//! `SET NX`, conditional `PEXPIRE` and hash fields. Every command is recorded
//! by name so tests can assert how many round trips an operation cost, and
//! the next N commands can be made to fail.

use crate::{ExpireCondition, KvStore, Result, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    commands: Vec<String>,
    failing: u32,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

impl Inner {
    /// Record the command and apply injected failures.
    fn begin(&mut self, command: &str) -> Result<()> {
        self.commands.push(command.to_string());
        if self.failing > 0 {
            self.failing -= 1;
            return Err(StoreError::Unavailable(format!(
                "injected failure on {command}"
            )));
        }
        Ok(())
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of every command executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn command_count(&self) -> usize {
        self.lock().commands.len()
    }

    /// How many times `command` has been executed.
    pub fn count_of(&self, command: &str) -> usize {
        self.lock().commands.iter().filter(|c| *c == command).count()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// Make the next `n` commands fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.lock().failing = n;
    }

    /// Write a string key directly, without TTL and without recording a command.
    pub fn insert(&self, key: &str, value: &str) {
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
    }

    /// Remove a key directly, without recording a command.
    pub fn remove(&self, key: &str) {
        self.lock().entries.remove(key);
    }

    /// Remaining time to live of a key, `None` if missing or persistent.
    pub fn pttl(&self, key: &str) -> Option<Duration> {
        let mut inner = self.lock();
        let at = inner.live(key)?.expires_at?;
        Some(at.saturating_duration_since(Instant::now()))
    }

    /// Read a string key without recording a command.
    pub fn peek(&self, key: &str) -> Option<String> {
        let mut inner = self.lock();
        match &inner.live(key)?.value {
            Value::Str(s) => Some(s.clone()),
            Value::Hash(_) => None,
        }
    }

    /// Snapshot a hash key without recording a command.
    pub fn peek_hash(&self, key: &str) -> HashMap<String, String> {
        let mut inner = self.lock();
        match inner.live(key).map(|e| &e.value) {
            Some(Value::Hash(h)) => h.clone(),
            _ => HashMap::new(),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.lock();
        inner.begin("SET")?;
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn pexpire(&self, key: &str, ttl: Duration, condition: ExpireCondition) -> Result<bool> {
        let mut inner = self.lock();
        inner.begin("PEXPIRE")?;
        let Some(entry) = inner.live(key) else {
            return Ok(false);
        };
        let allowed = match condition {
            ExpireCondition::Always => true,
            ExpireCondition::IfNoExpiry => entry.expires_at.is_none(),
            ExpireCondition::IfHasExpiry => entry.expires_at.is_some(),
        };
        if allowed {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(allowed)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.lock();
        inner.begin("GET")?;
        match inner.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::Hash(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock();
        inner.begin("DEL")?;
        let existed = inner.live(key).is_some();
        inner.entries.remove(key);
        Ok(existed)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut inner = self.lock();
        inner.begin("HGETALL")?;
        match inner.live(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(Value::Str(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hmset(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        let mut inner = self.lock();
        inner.begin("HMSET")?;
        if fields.is_empty() {
            return Ok(());
        }
        match inner.live(key) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => {
                h.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => {
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(fields.clone()),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }
}

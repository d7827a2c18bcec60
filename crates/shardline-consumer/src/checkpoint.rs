//! Checkpointer - Batched Cursor Persistence
//!
//! The checkpointer owns the last acknowledged cursor of every partition
//! ("heads") and writes them to the store in batches. Applications call
//! [`Record::done`](crate::Record::done), which pushes the cursor into the
//! checkpointer's ack channel; a single background task folds acks into the
//! heads and persists them.
//!
//! ## How It Works
//!
//! 1. **Begin**: load every head with one `HGETALL <prefix>:sequence`, then
//!    spawn the sync task.
//! 2. **Sync task** waits on four sources:
//!    - ack channel: `heads[partition] = cursor`, mark dirty
//!    - save timer (`save_period`): if dirty, one `HMSET` with the whole map
//!    - renew timer (4/5 of `lease_ttl`): extend every held lease
//!    - shutdown signal: drain queued acks, save once more, exit
//! 3. **End**: signal shutdown and wait for the final save.
//!
//! Store failures never stop the task; they are reported as faults on the
//! channel passed to [`Checkpointer::begin`] and the heads stay dirty so the
//! next tick retries.
//!
//! ## Leases
//!
//! The checkpointer also acts as the lease holder when no standalone
//! [`Provisioner`](crate::Provisioner) is configured. Leases live under
//! `<prefix>:lock:<partition>` and follow the same acquire/release contract
//! as [`LeaseManager`].
//!
//! ## Read-only mode
//!
//! With `read_only` set, heads are loaded but never written and lease calls
//! succeed without touching the store. Tailing tools use this to start from a
//! fleet's checkpoints without disturbing it.

use crate::error::{ConsumerError, LeaseError, LeaseResult, Result};
use crate::handler::FaultSender;
use crate::lease_manager::{LeaseManager, Provisioner};
use crate::record::{Ack, AckSender};
use async_trait::async_trait;
use shardline_core::Fault;
use shardline_store::{lock_key, sequence_key, ExpireCondition, KvStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Checkpoint persistence and (optionally) lease ownership.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Channel records acknowledge into, `None` when acks are discarded.
    fn ack_sender(&self) -> Option<AckSender>;

    /// Load stored heads and start background work.
    async fn begin(&self, faults: FaultSender) -> Result<()>;

    /// Stop background work after a final save.
    async fn end(&self) -> Result<()>;

    /// Last acknowledged cursor of a partition.
    fn start_sequence(&self, partition_id: &str) -> Option<String>;

    /// Persist dirty heads now. Returns whether a write was issued.
    async fn sync(&self) -> Result<bool>;

    async fn try_acquire(&self, partition_id: &str) -> LeaseResult<()>;

    async fn release(&self, partition_id: &str) -> LeaseResult<()>;
}

/// Settings for [`KvCheckpointer`].
#[derive(Debug, Clone)]
pub struct CheckpointerOptions {
    /// Key namespace shared by every worker of one application
    pub prefix: String,

    /// How often dirty heads are written
    pub save_period: Duration,

    /// Lease lifetime; leases are renewed every 4/5 of it
    pub lease_ttl: Duration,

    /// Load heads but never write heads or leases
    pub read_only: bool,

    /// Capacity of the ack channel
    pub ack_buffer: usize,
}

impl Default for CheckpointerOptions {
    fn default() -> Self {
        Self {
            prefix: "shardline".to_string(),
            save_period: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(30),
            read_only: false,
            ack_buffer: 1024,
        }
    }
}

impl CheckpointerOptions {
    fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(ConsumerError::Config("prefix must not be empty".into()));
        }
        if self.save_period.is_zero() {
            return Err(ConsumerError::Config("save_period must be positive".into()));
        }
        if self.lease_ttl < Duration::from_millis(5) {
            return Err(ConsumerError::Config(
                "lease_ttl must be at least 5ms".into(),
            ));
        }
        if self.ack_buffer == 0 {
            return Err(ConsumerError::Config("ack_buffer must be positive".into()));
        }
        Ok(())
    }

    /// Interval between lease renewals.
    pub fn renew_period(&self) -> Duration {
        self.lease_ttl * 4 / 5
    }
}

#[derive(Default)]
struct HeadState {
    heads: HashMap<String, String>,
    dirty: bool,
    /// Bumped on every ack so a save only clears `dirty` for what it wrote
    version: u64,
}

struct Shared {
    store: Arc<dyn KvStore>,
    options: CheckpointerOptions,
    leases: LeaseManager,
    state: Mutex<HeadState>,
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn record(&self, ack: Ack) {
        let mut state = guard(&self.state);
        state.heads.insert(ack.partition_id, ack.sequence_number);
        state.dirty = true;
        state.version += 1;
    }

    async fn sync(&self) -> Result<bool> {
        if self.options.read_only {
            return Ok(false);
        }

        let (snapshot, version) = {
            let state = guard(&self.state);
            if state.heads.is_empty() || !state.dirty {
                return Ok(false);
            }
            (state.heads.clone(), state.version)
        };

        self.store
            .hmset(&sequence_key(&self.options.prefix), &snapshot)
            .await?;

        let mut state = guard(&self.state);
        if state.version == version {
            state.dirty = false;
        }
        debug!(partitions = snapshot.len(), "Checkpoints saved");
        Ok(true)
    }
}

/// Checkpointer over a [`KvStore`], also holding partition leases.
pub struct KvCheckpointer {
    shared: Arc<Shared>,
    ack_tx: AckSender,
    ack_rx: Mutex<Option<mpsc::Receiver<Ack>>>,
    shutdown: watch::Sender<bool>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl KvCheckpointer {
    pub fn new(store: Arc<dyn KvStore>, options: CheckpointerOptions) -> Result<Self> {
        options.validate()?;

        let leases = LeaseManager::new(store.clone(), options.prefix.clone(), options.lease_ttl);
        let (ack_tx, ack_rx) = mpsc::channel(options.ack_buffer);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                options,
                leases,
                state: Mutex::new(HeadState::default()),
            }),
            ack_tx,
            ack_rx: Mutex::new(Some(ack_rx)),
            shutdown,
            handle: tokio::sync::Mutex::new(None),
        })
    }

    /// Token proving ownership of this checkpointer's leases.
    pub fn token(&self) -> &str {
        self.shared.leases.token()
    }

    pub fn options(&self) -> &CheckpointerOptions {
        &self.shared.options
    }

    /// Snapshot of every head.
    pub fn heads(&self) -> HashMap<String, String> {
        guard(&self.shared.state).heads.clone()
    }

    /// Whether some acknowledged cursor has not been written yet.
    pub fn is_dirty(&self) -> bool {
        guard(&self.shared.state).dirty
    }

    /// Partitions whose lease this checkpointer holds.
    pub fn held_partitions(&self) -> Vec<String> {
        self.shared.leases.held_partitions()
    }
}

#[async_trait]
impl Checkpointer for KvCheckpointer {
    fn ack_sender(&self) -> Option<AckSender> {
        Some(self.ack_tx.clone())
    }

    async fn begin(&self, faults: FaultSender) -> Result<()> {
        if guard(&self.ack_rx).is_none() {
            return Err(ConsumerError::AlreadyStarted);
        }

        let options = &self.shared.options;
        let heads = self
            .shared
            .store
            .hgetall(&sequence_key(&options.prefix))
            .await
            .map_err(ConsumerError::CheckpointLoad)?;

        let Some(acks) = guard(&self.ack_rx).take() else {
            return Err(ConsumerError::AlreadyStarted);
        };
        let loaded = heads.len();
        guard(&self.shared.state).heads = heads;

        let task = SyncTask {
            shared: Arc::clone(&self.shared),
            acks,
            shutdown: self.shutdown.subscribe(),
            faults,
        };
        let handle = tokio::spawn(async move {
            task.run().await;
        });
        *self.handle.lock().await = Some(handle);

        info!(
            prefix = %options.prefix,
            loaded,
            read_only = options.read_only,
            "Checkpointer started"
        );
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.await?;
            info!(prefix = %self.shared.options.prefix, "Checkpointer stopped");
        }
        Ok(())
    }

    fn start_sequence(&self, partition_id: &str) -> Option<String> {
        guard(&self.shared.state)
            .heads
            .get(partition_id)
            .filter(|seq| !seq.is_empty())
            .cloned()
    }

    async fn sync(&self) -> Result<bool> {
        self.shared.sync().await
    }

    async fn try_acquire(&self, partition_id: &str) -> LeaseResult<()> {
        if self.shared.options.read_only {
            return Ok(());
        }
        self.shared.leases.try_acquire(partition_id).await
    }

    async fn release(&self, partition_id: &str) -> LeaseResult<()> {
        if self.shared.options.read_only {
            return Ok(());
        }
        self.shared.leases.release(partition_id).await
    }
}

/// Background task folding acks into heads and saving them.
struct SyncTask {
    shared: Arc<Shared>,
    acks: mpsc::Receiver<Ack>,
    shutdown: watch::Receiver<bool>,
    faults: FaultSender,
}

impl SyncTask {
    async fn run(mut self) {
        let save_period = self.shared.options.save_period;
        let renew_period = self.shared.options.renew_period();

        let mut save = interval_at(Instant::now() + save_period, save_period);
        save.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renew = interval_at(Instant::now() + renew_period, renew_period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut acks_received: u64 = 0;

        loop {
            tokio::select! {
                _ = save.tick() => self.save().await,
                _ = renew.tick() => self.renew_leases().await,
                ack = self.acks.recv() => match ack {
                    Some(ack) => {
                        acks_received += 1;
                        self.shared.record(ack);
                    }
                    None => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        while let Ok(ack) = self.acks.try_recv() {
            acks_received += 1;
            self.shared.record(ack);
        }
        self.save().await;

        debug!(acks_received, "Checkpoint sync task stopped");
    }

    fn fault(&self, fault: Fault) {
        let _ = self.faults.send(fault);
    }

    async fn save(&self) {
        if let Err(e) = self.shared.sync().await {
            warn!(error = %e, "Checkpoint save failed");
            self.fault(Fault::warning(format!("checkpoint save failed: {e}")));
        }
    }

    /// Extend every held lease, re-acquiring any that expired.
    async fn renew_leases(&self) {
        let leases = &self.shared.leases;
        let ttl = self.shared.options.lease_ttl;

        for partition_id in leases.held_partitions() {
            let key = lock_key(leases.prefix(), &partition_id);

            match self.shared.store.get(&key).await {
                Ok(Some(value)) if value != leases.token() => {
                    leases.forget(&partition_id);
                    warn!(partition_id = %partition_id, "Lease taken over by another process");
                    self.fault(
                        Fault::error("lease lost to another process").with_partition(&partition_id),
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    self.fault(
                        Fault::warning(format!("lease check failed: {e}"))
                            .with_partition(&partition_id),
                    );
                    continue;
                }
            }

            let extended = match self
                .shared
                .store
                .pexpire(&key, ttl, ExpireCondition::IfHasExpiry)
                .await
            {
                Ok(extended) => extended,
                Err(e) => {
                    self.fault(
                        Fault::warning(format!("lease renewal failed: {e}"))
                            .with_partition(&partition_id),
                    );
                    false
                }
            };
            if extended {
                continue;
            }

            leases.forget(&partition_id);
            match leases.acquire_in_store(&partition_id).await {
                Ok(()) => debug!(partition_id = %partition_id, "Lease re-acquired"),
                Err(e @ LeaseError::AcquireFailed(_)) => {
                    self.fault(Fault::error(e.to_string()).with_partition(&partition_id));
                }
                Err(e) => {
                    self.fault(
                        Fault::warning(format!("lease re-acquire failed: {e}"))
                            .with_partition(&partition_id),
                    );
                }
            }
        }
    }
}

/// Checkpointer that remembers nothing and grants every lease.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpointer;

#[async_trait]
impl Checkpointer for NoopCheckpointer {
    fn ack_sender(&self) -> Option<AckSender> {
        None
    }

    async fn begin(&self, _faults: FaultSender) -> Result<()> {
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        Ok(())
    }

    fn start_sequence(&self, _partition_id: &str) -> Option<String> {
        None
    }

    async fn sync(&self) -> Result<bool> {
        Ok(false)
    }

    async fn try_acquire(&self, _partition_id: &str) -> LeaseResult<()> {
        Ok(())
    }

    async fn release(&self, _partition_id: &str) -> LeaseResult<()> {
        Ok(())
    }
}

//! Partition Poller - One Task per Partition
//!
//! A poller reads a single partition from its checkpoint (or a configured
//! start position) and feeds records into the consumer's shared channel.
//!
//! ## States
//!
//! ```text
//!   Starting ──start()──▶ Iterating ──stop signal──▶ Draining ──▶ Ended
//!                            │
//!                            └── partition exhausted / gave up ──▶ Ended
//! ```
//!
//! ## One cycle ([`PartitionPoller::poll_once`])
//!
//! 1. If the partition is closed and its last cursor has been delivered, emit
//!    an info fault and end.
//! 2. If stop was requested, drain.
//! 3. Heartbeat the lease when a standalone provisioner is configured.
//! 4. Fetch a batch:
//!    - error: warning fault, re-acquire the iterator after the last delivered
//!      cursor (critical fault and end if that keeps failing)
//!    - empty and lag below the threshold: wait `poll_interval` or for stop
//!    - empty and lag at or above the threshold: go again immediately
//!    - records: emit each one, advancing the cursor as they are handed over
//!
//! Every send into the shared channel blocks while it is full, which is how a
//! slow application throttles the fetch rate. Sends also give way to the stop
//! signal so shutdown never waits on a reader that went away.

use crate::checkpoint::Checkpointer;
use crate::error::{ConsumerError, LeaseError, Result};
use crate::lease_manager::Provisioner;
use crate::record::{AckSender, Event, Record};
use crate::retry::{retry_with_backoff, RetryPolicy};
use shardline_core::{Fault, IteratorPosition, Partition, StreamClient, StreamError};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Where to start reading a partition that has no checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InitialPosition {
    /// Oldest retained record
    #[default]
    Earliest,
    /// Only records written from now on
    Latest,
    /// Records that arrived within the given window before start-up
    Replay(Duration),
}

impl InitialPosition {
    pub fn resolve(&self) -> IteratorPosition {
        match self {
            InitialPosition::Earliest => IteratorPosition::Earliest,
            InitialPosition::Latest => IteratorPosition::Latest,
            InitialPosition::Replay(window) => {
                let at = SystemTime::now()
                    .checked_sub(*window)
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                IteratorPosition::AtTimestamp(at)
            }
        }
    }
}

/// Per-poller tuning.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Wait between fetches once caught up
    pub poll_interval: Duration,

    /// Maximum records per fetch
    pub fetch_limit: usize,

    /// Lag at or above which an empty fetch is retried without waiting
    pub lag_threshold: Duration,

    /// Start position for partitions without a checkpoint
    pub initial_position: InitialPosition,

    /// Backoff for obtaining iterators
    pub iterator_retry: RetryPolicy,

    /// Stop this poller when its lease turns out to belong to someone else
    pub stop_on_lease_loss: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            fetch_limit: 1000,
            lag_threshold: Duration::from_millis(30_000),
            initial_position: InitialPosition::Earliest,
            iterator_retry: RetryPolicy::default(),
            stop_on_lease_loss: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Starting,
    Iterating,
    Draining,
    Ended,
}

/// Channels connecting a poller to its consumer.
pub struct PollerChannels {
    /// Shared record/fault channel
    pub events: mpsc::Sender<Event>,
    /// Stop broadcast
    pub stop: watch::Receiver<bool>,
    /// Receives the partition id once the poller has finished
    pub stopped: mpsc::Sender<String>,
}

pub struct PartitionPoller {
    stream: String,
    partition: Partition,
    client: Arc<dyn StreamClient>,
    checkpointer: Arc<dyn Checkpointer>,
    provisioner: Option<Arc<dyn Provisioner>>,
    config: PollerConfig,
    channels: PollerChannels,
    ack: Option<AckSender>,
    state: PollerState,
    iterator: Option<String>,
    /// Cursor of the last record handed over (or the checkpoint)
    last_sequence: Option<String>,
    /// Position used when nothing has been delivered yet
    start_position: IteratorPosition,
    delivered: u64,
}

impl PartitionPoller {
    pub fn new(
        stream: impl Into<String>,
        partition: Partition,
        client: Arc<dyn StreamClient>,
        checkpointer: Arc<dyn Checkpointer>,
        config: PollerConfig,
        channels: PollerChannels,
    ) -> Self {
        let ack = checkpointer.ack_sender();
        Self {
            stream: stream.into(),
            partition,
            client,
            checkpointer,
            provisioner: None,
            config,
            channels,
            ack,
            state: PollerState::Starting,
            iterator: None,
            last_sequence: None,
            start_position: IteratorPosition::Earliest,
            delivered: 0,
        }
    }

    /// Heartbeat leases through a standalone provisioner on every cycle.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Cursor of the last delivered record, or the checkpoint it started from.
    pub fn last_sequence(&self) -> Option<&str> {
        self.last_sequence.as_deref()
    }

    /// Choose the start position and obtain the first iterator.
    ///
    /// Fails only when no iterator can be obtained after retries.
    pub async fn start(&mut self) -> Result<()> {
        let position = match self.checkpointer.start_sequence(&self.partition.id) {
            Some(sequence) => {
                self.last_sequence = Some(sequence.clone());
                IteratorPosition::AfterSequence(sequence)
            }
            None => {
                let position = self.config.initial_position.resolve();
                self.emit_fault(
                    Fault::info(format!(
                        "no checkpoint, starting from {}",
                        position.describe()
                    ))
                    .with_partition(&self.partition.id),
                )
                .await;
                position
            }
        };
        self.start_position = position.clone();

        let iterator = self.acquire_iterator(position).await.map_err(|source| {
            ConsumerError::IteratorUnavailable {
                partition: self.partition.id.clone(),
                source,
            }
        })?;
        self.iterator = Some(iterator);
        self.state = PollerState::Iterating;

        debug!(
            stream = %self.stream,
            partition_id = %self.partition.id,
            position = %self.start_position.describe(),
            "Partition poller ready"
        );
        Ok(())
    }

    /// Run cycles until the poller drains or ends, then report it stopped.
    pub async fn run(mut self) {
        info!(partition_id = %self.partition.id, "Partition poller started");

        while self.state == PollerState::Iterating {
            self.poll_once().await;
        }

        let final_state = self.state;
        self.state = PollerState::Ended;
        let _ = self.channels.stopped.send(self.partition.id.clone()).await;

        info!(
            partition_id = %self.partition.id,
            delivered = self.delivered,
            last_sequence = ?self.last_sequence,
            via = ?final_state,
            "Partition poller stopped"
        );
    }

    /// Execute one cycle and return the resulting state.
    pub async fn poll_once(&mut self) -> PollerState {
        if self.state != PollerState::Iterating {
            return self.state;
        }

        if self.reached_end() {
            self.exhausted().await;
            return self.state;
        }

        if self.stop_requested() {
            self.state = PollerState::Draining;
            return self.state;
        }

        if !self.heartbeat().await {
            self.state = PollerState::Draining;
            return self.state;
        }

        let Some(iterator) = self.iterator.clone() else {
            self.reacquire_iterator().await;
            return self.state;
        };

        match self
            .client
            .fetch_records(&iterator, self.config.fetch_limit)
            .await
        {
            Err(e) => {
                warn!(partition_id = %self.partition.id, error = %e, "Fetch failed");
                self.emit_fault(
                    Fault::warning(format!("fetch failed: {e}")).with_partition(&self.partition.id),
                )
                .await;
                self.iterator = None;
                if self.state == PollerState::Iterating {
                    self.reacquire_iterator().await;
                }
                if self.state == PollerState::Iterating {
                    self.wait_for_records().await;
                }
            }
            Ok(batch) => {
                self.iterator = batch.next_iterator;
                let lag = batch.millis_behind_latest;

                if batch.records.is_empty() {
                    if self.iterator.is_none() {
                        self.exhausted().await;
                    } else if lag < self.config.lag_threshold.as_millis() as i64 {
                        self.wait_for_records().await;
                    }
                    return self.state;
                }

                debug!(
                    partition_id = %self.partition.id,
                    count = batch.records.len(),
                    millis_behind_latest = lag,
                    "Fetched records"
                );

                for record in batch.records {
                    let sequence = record.sequence_number.clone();
                    let record = Record::new(record, &self.partition.id, lag, self.ack.clone());
                    if !self.deliver(Event::Record(record)).await {
                        self.state = PollerState::Draining;
                        return self.state;
                    }
                    self.last_sequence = Some(sequence);
                    self.delivered += 1;
                }

                if self.iterator.is_none() {
                    self.exhausted().await;
                }
            }
        }

        self.state
    }

    fn reached_end(&self) -> bool {
        match (&self.partition.ending_sequence, &self.last_sequence) {
            (Some(end), Some(last)) => end == last,
            _ => false,
        }
    }

    fn stop_requested(&self) -> bool {
        *self.channels.stop.borrow()
    }

    /// Returns `false` when the poller should stop because its lease is gone.
    async fn heartbeat(&mut self) -> bool {
        let Some(provisioner) = self.provisioner.clone() else {
            return true;
        };
        match provisioner.heartbeat(&self.partition.id).await {
            Ok(()) => true,
            Err(e) => {
                let lost = matches!(e, LeaseError::LockChanged(_));
                self.emit_fault(
                    Fault::error(format!("lease heartbeat failed: {e}"))
                        .with_partition(&self.partition.id),
                )
                .await;
                !(lost && self.config.stop_on_lease_loss)
            }
        }
    }

    async fn wait_for_records(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = self.channels.stop.changed() => {
                self.state = PollerState::Draining;
            }
        }
    }

    async fn exhausted(&mut self) {
        info!(partition_id = %self.partition.id, "Partition exhausted");
        self.emit_fault(Fault::info("partition exhausted").with_partition(&self.partition.id))
            .await;
        self.state = PollerState::Ended;
    }

    async fn acquire_iterator(
        &self,
        position: IteratorPosition,
    ) -> std::result::Result<String, StreamError> {
        retry_with_backoff(&self.config.iterator_retry, || {
            self.client
                .get_iterator(&self.stream, &self.partition.id, position.clone())
        })
        .await
    }

    async fn reacquire_iterator(&mut self) {
        let position = match &self.last_sequence {
            Some(sequence) => IteratorPosition::AfterSequence(sequence.clone()),
            None => self.start_position.clone(),
        };

        match self.acquire_iterator(position).await {
            Ok(iterator) => self.iterator = Some(iterator),
            Err(e) => {
                self.emit_fault(
                    Fault::critical(format!("could not re-acquire iterator: {e}"))
                        .with_partition(&self.partition.id),
                )
                .await;
                self.state = PollerState::Ended;
            }
        }
    }

    /// Hand an event to the consumer. Returns `false` if stopped first.
    async fn deliver(&mut self, event: Event) -> bool {
        tokio::select! {
            sent = self.channels.events.send(event) => sent.is_ok(),
            _ = self.channels.stop.changed() => false,
        }
    }

    async fn emit_fault(&mut self, fault: Fault) {
        if !self.deliver(Event::Fault(fault)).await && self.state == PollerState::Iterating {
            self.state = PollerState::Draining;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointerOptions, KvCheckpointer, NoopCheckpointer};
    use crate::lease_manager::LeaseManager;
    use shardline_core::{MemoryStream, Severity};
    use shardline_store::{KvStore, MemoryKvStore};
    use tokio::time::Instant;

    struct Harness {
        events: mpsc::Receiver<Event>,
        stop: watch::Sender<bool>,
        stopped: mpsc::Receiver<String>,
    }

    impl Harness {
        fn drain(&mut self) -> (Vec<Record>, Vec<Fault>) {
            let mut records = Vec::new();
            let mut faults = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                match event {
                    Event::Record(r) => records.push(r),
                    Event::Fault(f) => faults.push(f),
                }
            }
            (records, faults)
        }
    }

    fn config() -> PollerConfig {
        PollerConfig {
            poll_interval: Duration::from_secs(1),
            iterator_retry: RetryPolicy::new(
                2,
                Duration::from_millis(10),
                Duration::from_millis(100),
                2.0,
            ),
            ..PollerConfig::default()
        }
    }

    fn poller_for(
        stream: &Arc<MemoryStream>,
        partition: Partition,
        checkpointer: Arc<dyn Checkpointer>,
        config: PollerConfig,
    ) -> (PartitionPoller, Harness) {
        let (events_tx, events) = mpsc::channel(256);
        let (stop, stop_rx) = watch::channel(false);
        let (stopped_tx, stopped) = mpsc::channel(1);
        let poller = PartitionPoller::new(
            "events",
            partition,
            stream.clone() as Arc<dyn StreamClient>,
            checkpointer,
            config,
            PollerChannels {
                events: events_tx,
                stop: stop_rx,
                stopped: stopped_tx,
            },
        );
        (
            poller,
            Harness {
                events,
                stop,
                stopped,
            },
        )
    }

    async fn partition(stream: &MemoryStream, id: &str) -> Partition {
        stream
            .list_partitions("events")
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.id == id)
            .unwrap()
    }

    async fn seeded_checkpointer(heads: &[(&str, &str)]) -> Arc<KvCheckpointer> {
        let store = Arc::new(MemoryKvStore::new());
        let map = heads
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        store.hmset("test:sequence", &map).await.unwrap();
        let cp = KvCheckpointer::new(
            store as Arc<dyn KvStore>,
            CheckpointerOptions {
                prefix: "test".to_string(),
                save_period: Duration::from_secs(3600),
                ..CheckpointerOptions::default()
            },
        )
        .unwrap();
        let (faults, _rx) = mpsc::unbounded_channel();
        cp.begin(faults).await.unwrap();
        Arc::new(cp)
    }

    // ----------------------------------------------------------------
    // Starting
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn test_start_without_checkpoint_uses_earliest() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        stream.put_record("events", "shard-0", "a").unwrap();
        stream.put_record("events", "shard-0", "b").unwrap();

        let p = partition(&stream, "shard-0").await;
        let (mut poller, mut h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config());

        poller.start().await.unwrap();
        assert_eq!(poller.state(), PollerState::Iterating);

        let (_, faults) = h.drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].severity, Severity::Info);
        assert!(faults[0].message.contains("earliest"));
        assert_eq!(
            stream.iterator_requests(),
            vec![("shard-0".to_string(), IteratorPosition::Earliest)]
        );

        assert_eq!(poller.poll_once().await, PollerState::Iterating);
        let (records, _) = h.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data.as_ref(), b"a");
        assert_eq!(records[1].partition_id, "shard-0");
        assert_eq!(poller.last_sequence(), Some(records[1].sequence_number.as_str()));
    }

    #[tokio::test]
    async fn test_start_after_checkpoint() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        let first = stream.put_record("events", "shard-0", "a").unwrap();
        stream.put_record("events", "shard-0", "b").unwrap();

        let cp = seeded_checkpointer(&[("shard-0", &first)]).await;
        let p = partition(&stream, "shard-0").await;
        let (mut poller, mut h) = poller_for(&stream, p, cp.clone(), config());

        poller.start().await.unwrap();
        poller.poll_once().await;

        let (records, faults) = h.drain();
        assert!(faults.is_empty());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data.as_ref(), b"b");
        assert!(records[0].is_ackable());
        cp.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_position() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        let p = partition(&stream, "shard-0").await;
        let cfg = PollerConfig {
            initial_position: InitialPosition::Replay(Duration::from_secs(60)),
            ..config()
        };
        let (mut poller, _h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), cfg);

        poller.start().await.unwrap();

        let requests = stream.iterator_requests();
        assert!(matches!(requests[0].1, IteratorPosition::AtTimestamp(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_when_no_iterator() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        stream.fail_next_iterators(10);
        let p = partition(&stream, "shard-0").await;
        let (mut poller, _h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config());

        match poller.start().await {
            Err(ConsumerError::IteratorUnavailable { partition, .. }) => {
                assert_eq!(partition, "shard-0")
            }
            other => panic!("expected IteratorUnavailable, got {:?}", other),
        }
        assert_eq!(stream.iterator_requests().len(), 3);
    }

    // ----------------------------------------------------------------
    // Empty batches and lag
    // ----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_below_threshold_waits() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        stream.set_lag(5_000);
        let p = partition(&stream, "shard-0").await;
        let (mut poller, _h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config());
        poller.start().await.unwrap();

        let started = Instant::now();
        assert_eq!(poller.poll_once().await, PollerState::Iterating);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_above_threshold_retries_immediately() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        stream.set_lag(40_000);
        let p = partition(&stream, "shard-0").await;
        let (mut poller, _h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config());
        poller.start().await.unwrap();

        let started = Instant::now();
        poller.poll_once().await;
        poller.poll_once().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(stream.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_wait() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        let p = partition(&stream, "shard-0").await;
        let cfg = PollerConfig {
            poll_interval: Duration::from_secs(3600),
            ..config()
        };
        let (mut poller, h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), cfg);
        poller.start().await.unwrap();

        let Harness {
            stop,
            events: _events,
            stopped: _stopped,
        } = h;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = stop.send(true);
        });

        let started = Instant::now();
        assert_eq!(poller.poll_once().await, PollerState::Draining);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    // ----------------------------------------------------------------
    // Exhaustion
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn test_checkpoint_at_end_terminates_without_fetch() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        let last = stream.put_record("events", "shard-0", "a").unwrap();
        stream.close_partition("events", "shard-0").unwrap();

        let cp = seeded_checkpointer(&[("shard-0", &last)]).await;
        let p = partition(&stream, "shard-0").await;
        let (mut poller, mut h) = poller_for(&stream, p, cp.clone(), config());
        poller.start().await.unwrap();

        assert_eq!(poller.poll_once().await, PollerState::Ended);
        assert_eq!(stream.fetch_count(), 0);

        let (records, faults) = h.drain();
        assert!(records.is_empty());
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].severity, Severity::Info);
        assert_eq!(faults[0].message, "partition exhausted");
        cp.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_partition_read_to_end() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        stream.put_record("events", "shard-0", "a").unwrap();
        stream.put_record("events", "shard-0", "b").unwrap();
        stream.close_partition("events", "shard-0").unwrap();

        let p = partition(&stream, "shard-0").await;
        let (mut poller, mut h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config());
        poller.start().await.unwrap();

        assert_eq!(poller.poll_once().await, PollerState::Ended);
        let (records, faults) = h.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(faults.last().unwrap().message, "partition exhausted");
    }

    // ----------------------------------------------------------------
    // Fetch failures
    // ----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_resumes_after_last_delivered() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        let a = stream.put_record("events", "shard-0", "a").unwrap();
        stream.set_lag(40_000);

        let p = partition(&stream, "shard-0").await;
        let (mut poller, mut h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config());
        poller.start().await.unwrap();
        poller.poll_once().await;
        h.drain();

        stream.put_record("events", "shard-0", "b").unwrap();
        stream.fail_next_fetches(1);
        assert_eq!(poller.poll_once().await, PollerState::Iterating);

        let (records, faults) = h.drain();
        assert!(records.is_empty());
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].severity, Severity::Warning);
        assert_eq!(
            stream.iterator_requests().last().unwrap().1,
            IteratorPosition::AfterSequence(a)
        );

        poller.poll_once().await;
        let (records, _) = h.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data.as_ref(), b"b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_before_delivery_keeps_start_position() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        stream.put_record("events", "shard-0", "a").unwrap();

        let p = partition(&stream, "shard-0").await;
        let (mut poller, mut h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config());
        poller.start().await.unwrap();
        stream.fail_next_fetches(1);

        poller.poll_once().await;
        poller.poll_once().await;

        let (records, _) = h.drain();
        assert_eq!(records.len(), 1);
        let requests = stream.iterator_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].1, IteratorPosition::Earliest);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_exhausted_is_critical() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        let p = partition(&stream, "shard-0").await;
        let (mut poller, mut h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config());
        poller.start().await.unwrap();

        stream.fail_next_fetches(1);
        stream.fail_next_iterators(10);
        assert_eq!(poller.poll_once().await, PollerState::Ended);

        let (_, faults) = h.drain();
        let severities: Vec<Severity> = faults.iter().map(|f| f.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Info, Severity::Warning, Severity::Critical]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failures_wait_poll_interval() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        let p = partition(&stream, "shard-0").await;
        let (mut poller, mut h) =
            poller_for(&stream, p, Arc::new(NoopCheckpointer), PollerConfig::default());
        poller.start().await.unwrap();

        stream.fail_next_fetches(5);
        let started = Instant::now();
        for _ in 0..5 {
            assert_eq!(poller.poll_once().await, PollerState::Iterating);
        }

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(stream.fetch_count(), 5);
        let (_, faults) = h.drain();
        assert!(faults.iter().all(|f| !f.is_fatal()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_wait_after_fetch_failure() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        let p = partition(&stream, "shard-0").await;
        let config = PollerConfig {
            poll_interval: Duration::from_secs(3600),
            ..PollerConfig::default()
        };
        let (mut poller, h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config);
        poller.start().await.unwrap();
        stream.fail_next_fetches(1);

        let Harness { stop, mut events, .. } = h;
        let handle = tokio::spawn(async move { (poller.poll_once().await, Instant::now()) });
        // wait for the warning so the poller is parked in its poll wait
        loop {
            if let Some(Event::Fault(f)) = events.recv().await {
                if f.severity == Severity::Warning {
                    break;
                }
            }
        }
        let before = Instant::now();
        stop.send(true).unwrap();

        let (state, finished) = handle.await.unwrap();
        assert_eq!(state, PollerState::Draining);
        assert!(finished.duration_since(before) < Duration::from_secs(3600));
    }

    // ----------------------------------------------------------------
    // Stop and leases
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn test_run_reports_stopped() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        let p = partition(&stream, "shard-0").await;
        let (mut poller, mut h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config());
        poller.start().await.unwrap();

        h.stop.send(true).unwrap();
        let handle = tokio::spawn(poller.run());

        assert_eq!(h.stopped.recv().await.as_deref(), Some("shard-0"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_unblocks_full_channel() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        for i in 0..4 {
            stream.put_record("events", "shard-0", format!("r{i}")).unwrap();
        }
        let p = partition(&stream, "shard-0").await;

        let (events_tx, _events) = mpsc::channel(1);
        let (stop, stop_rx) = watch::channel(false);
        let (stopped_tx, mut stopped) = mpsc::channel(1);
        let mut poller = PartitionPoller::new(
            "events",
            p,
            stream.clone() as Arc<dyn StreamClient>,
            Arc::new(NoopCheckpointer),
            config(),
            PollerChannels {
                events: events_tx,
                stop: stop_rx,
                stopped: stopped_tx,
            },
        );
        poller.start().await.unwrap();
        let handle = tokio::spawn(poller.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(true).unwrap();

        assert_eq!(stopped.recv().await.as_deref(), Some("shard-0"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_loss_stops_poller_when_configured() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        let p = partition(&stream, "shard-0").await;

        let store = Arc::new(MemoryKvStore::new());
        let leases = Arc::new(LeaseManager::new(
            store.clone() as Arc<dyn KvStore>,
            "test",
            Duration::from_secs(10),
        ));
        leases.try_acquire("shard-0").await.unwrap();
        store.insert("test:lock:shard-0", "other-worker");

        let cfg = PollerConfig {
            stop_on_lease_loss: true,
            ..config()
        };
        let (poller, mut h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), cfg);
        let mut poller = poller.with_provisioner(leases);
        poller.start().await.unwrap();

        assert_eq!(poller.poll_once().await, PollerState::Draining);
        let (_, faults) = h.drain();
        assert_eq!(faults.last().unwrap().severity, Severity::Error);
        assert_eq!(stream.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_lease_loss_tolerated_by_default() {
        let stream = Arc::new(MemoryStream::new());
        stream.create_stream("events", 1);
        stream.put_record("events", "shard-0", "a").unwrap();
        let p = partition(&stream, "shard-0").await;

        let store = Arc::new(MemoryKvStore::new());
        let leases = Arc::new(LeaseManager::new(
            store.clone() as Arc<dyn KvStore>,
            "test",
            Duration::from_secs(10),
        ));
        store.insert("test:lock:shard-0", "other-worker");

        let (poller, mut h) = poller_for(&stream, p, Arc::new(NoopCheckpointer), config());
        let mut poller = poller.with_provisioner(leases);
        poller.start().await.unwrap();

        assert_eq!(poller.poll_once().await, PollerState::Iterating);
        let (records, faults) = h.drain();
        assert_eq!(records.len(), 1);
        assert!(faults.iter().any(|f| f.severity == Severity::Error));
    }
}

//! Stream Consumer - Orchestration
//!
//! [`StreamConsumer`] ties the pieces together: it discovers partitions,
//! claims a lease for each, starts one [`PartitionPoller`] per claimed
//! partition and merges their output into a single record stream.
//!
//! ## Lifecycle
//!
//! 1. **Build**: configure via [`StreamConsumerBuilder`]
//! 2. **Begin**: list partitions, load checkpoints, claim leases, start pollers
//! 3. **Run**: read [`Records`], call [`Record::done`] after processing each one
//! 4. **End**: stop pollers, release leases, flush checkpoints, close the stream
//!
//! ## Fault routing
//!
//! Pollers send records and faults over one bounded channel; the checkpointer
//! reports faults over its own channel. A relay task forwards records to the
//! [`Records`] handle and hands every fault to the configured
//! [`FaultHandler`]. The default handler logs and aborts on `Critical` and
//! `Error` faults, so long-running services usually install their own.
//!
//! ## Example
//!
//! ```rust,no_run
//! use shardline_consumer::{KvCheckpointer, CheckpointerOptions, StreamConsumer};
//! use shardline_core::MemoryStream;
//! use shardline_store::MemoryKvStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryKvStore::new());
//! let checkpointer = KvCheckpointer::new(store, CheckpointerOptions::default())?;
//!
//! let consumer = StreamConsumer::builder()
//!     .stream("events")
//!     .client(Arc::new(MemoryStream::new()))
//!     .checkpointer(Arc::new(checkpointer))
//!     .fault_handler(|fault: &shardline_core::Fault| eprintln!("{fault}"))
//!     .build()?;
//!
//! consumer.begin().await?;
//! let mut records = consumer.records().expect("records taken once");
//! while let Some(record) = records.recv().await {
//!     println!("{:?}", record.data);
//!     record.done().await?;
//! }
//! consumer.end().await?;
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{Checkpointer, NoopCheckpointer};
use crate::error::{ConsumerError, Result};
use crate::handler::{DefaultFaultHandler, FaultHandler, FaultSender};
use crate::lease_manager::Provisioner;
use crate::poller::{InitialPosition, PartitionPoller, PollerChannels, PollerConfig};
use crate::record::{Event, Record};
use crate::retry::RetryPolicy;
use futures::Stream;
use shardline_core::{Fault, StreamClient};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stream to consume
    pub stream: String,

    /// Settings shared by every partition poller
    pub poller: PollerConfig,

    /// Capacity of the poller and output channels (default: 128)
    pub output_buffer: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream: String::new(),
            poller: PollerConfig::default(),
            output_buffer: 128,
        }
    }
}

/// Read side of the merged record stream.
///
/// Yields `None` once the consumer has ended.
pub struct Records {
    rx: mpsc::Receiver<Record>,
}

impl Records {
    pub async fn recv(&mut self) -> Option<Record> {
        self.rx.recv().await
    }
}

impl Stream for Records {
    type Item = Record;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Record>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

enum ConsumerState {
    Created,
    Started(Running),
    Stopped,
}

/// Everything `end()` needs to tear a started consumer down.
struct Running {
    stop: watch::Sender<bool>,
    stopped: mpsc::Receiver<String>,
    pollers: Vec<JoinHandle<()>>,
    partitions: Vec<String>,
    faults: FaultSender,
    relay: Relay,
}

struct Relay {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Relay {
    async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.handle.await?;
        Ok(())
    }
}

/// Consumes every partition of one stream it can claim.
pub struct StreamConsumer {
    config: ConsumerConfig,
    client: Arc<dyn StreamClient>,
    checkpointer: Arc<dyn Checkpointer>,
    provisioner: Option<Arc<dyn Provisioner>>,
    handler: Arc<dyn FaultHandler>,
    state: tokio::sync::Mutex<ConsumerState>,
    records: Mutex<Option<Records>>,
    partitions: Mutex<Vec<String>>,
}

impl StreamConsumer {
    pub fn builder() -> StreamConsumerBuilder {
        StreamConsumerBuilder::new()
    }

    /// Consumer with default settings and no checkpoints.
    pub fn new(stream: impl Into<String>, client: Arc<dyn StreamClient>) -> Result<Self> {
        Self::builder().stream(stream).client(client).build()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Start reading every partition whose lease could be claimed.
    ///
    /// Returns the number of pollers launched.
    pub async fn begin(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        match *state {
            ConsumerState::Created => {}
            ConsumerState::Started(_) => return Err(ConsumerError::AlreadyStarted),
            ConsumerState::Stopped => return Err(ConsumerError::Stopped),
        }

        let stream = self.config.stream.clone();
        info!(stream = %stream, "Starting consumer");

        let partitions = self
            .client
            .list_partitions(&stream)
            .await
            .map_err(|source| ConsumerError::Discovery {
                stream: stream.clone(),
                source,
            })?;

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        self.checkpointer.begin(fault_tx.clone()).await?;

        let (events_tx, events_rx) = mpsc::channel(self.config.output_buffer);
        let (out_tx, out_rx) = mpsc::channel(self.config.output_buffer);
        let relay = spawn_relay(events_rx, fault_rx, out_tx, Arc::clone(&self.handler));

        let (stop_tx, _) = watch::channel(false);
        let (stopped_tx, stopped_rx) = mpsc::channel(partitions.len().max(1));

        let mut pollers = Vec::new();
        let mut claimed = Vec::new();

        for partition in partitions {
            let id = partition.id.clone();
            let lease = match &self.provisioner {
                Some(provisioner) => provisioner.try_acquire(&id).await,
                None => self.checkpointer.try_acquire(&id).await,
            };
            if let Err(e) = lease {
                debug!(partition_id = %id, error = %e, "Skipping partition");
                let _ = fault_tx.send(Fault::info(format!("skipped: {e}")).with_partition(&id));
                continue;
            }
            claimed.push(id.clone());

            let mut poller = PartitionPoller::new(
                stream.clone(),
                partition,
                Arc::clone(&self.client),
                Arc::clone(&self.checkpointer),
                self.config.poller.clone(),
                PollerChannels {
                    events: events_tx.clone(),
                    stop: stop_tx.subscribe(),
                    stopped: stopped_tx.clone(),
                },
            );
            if let Some(provisioner) = &self.provisioner {
                poller = poller.with_provisioner(Arc::clone(provisioner));
            }

            if let Err(e) = poller.start().await {
                warn!(partition_id = %id, error = %e, "Poller failed to start");
                self.abort_begin(&claimed, relay).await;
                return Err(e);
            }
            pollers.push(poller);
        }

        let launched = pollers.len();
        let handles = pollers
            .into_iter()
            .map(|poller| tokio::spawn(poller.run()))
            .collect();

        *self.records.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Records { rx: out_rx });
        *self.partitions.lock().unwrap_or_else(PoisonError::into_inner) = claimed.clone();

        *state = ConsumerState::Started(Running {
            stop: stop_tx,
            stopped: stopped_rx,
            pollers: handles,
            partitions: claimed,
            faults: fault_tx,
            relay,
        });

        info!(stream = %stream, partitions = launched, "Consumer started");
        Ok(launched)
    }

    /// Undo a partially completed `begin()`.
    async fn abort_begin(&self, claimed: &[String], relay: Relay) {
        for id in claimed {
            let released = match &self.provisioner {
                Some(provisioner) => provisioner.release(id).await,
                None => self.checkpointer.release(id).await,
            };
            if let Err(e) = released {
                debug!(partition_id = %id, error = %e, "Release after failed start");
            }
        }
        if let Err(e) = self.checkpointer.end().await {
            warn!(error = %e, "Checkpointer shutdown after failed start");
        }
        if let Err(e) = relay.shutdown().await {
            warn!(error = %e, "Relay shutdown after failed start");
        }
    }

    /// Stop every poller, release leases and flush checkpoints.
    ///
    /// The [`Records`] stream ends once this returns.
    pub async fn end(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let running = match std::mem::replace(&mut *state, ConsumerState::Stopped) {
            ConsumerState::Started(running) => running,
            other => {
                *state = other;
                warn!(stream = %self.config.stream, "Consumer not started, nothing to stop");
                return Ok(());
            }
        };

        info!(stream = %self.config.stream, "Stopping consumer");
        let Running {
            stop,
            mut stopped,
            pollers,
            partitions,
            faults,
            relay,
        } = running;

        let _ = stop.send(true);

        let expected = pollers.len();
        let mut acknowledged = 0;
        while acknowledged < expected {
            match stopped.recv().await {
                Some(partition_id) => {
                    debug!(partition_id = %partition_id, "Poller stopped");
                    acknowledged += 1;
                }
                None => break,
            }
        }

        let mut first_error = None;
        for handle in pollers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Poller task failed");
                first_error.get_or_insert(ConsumerError::Join(e));
            }
        }

        if let Some(provisioner) = &self.provisioner {
            for id in &partitions {
                if let Err(e) = provisioner.release(id).await {
                    let _ = faults.send(
                        Fault::warning(format!("lease release failed: {e}")).with_partition(id),
                    );
                }
            }
        }

        if let Err(e) = self.checkpointer.end().await {
            warn!(error = %e, "Checkpointer shutdown failed");
            first_error.get_or_insert(e);
        }

        drop(faults);
        if let Err(e) = relay.shutdown().await {
            first_error.get_or_insert(e);
        }

        info!(
            stream = %self.config.stream,
            pollers = expected,
            "Consumer stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Take the merged record stream. Returns `Some` once, after `begin()`.
    pub fn records(&self) -> Option<Records> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Partitions claimed by the last `begin()`.
    pub fn partitions(&self) -> Vec<String> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn is_started(&self) -> bool {
        matches!(*self.state.lock().await, ConsumerState::Started(_))
    }
}

fn spawn_relay(
    mut events: mpsc::Receiver<Event>,
    mut faults: mpsc::UnboundedReceiver<Fault>,
    out: mpsc::Sender<Record>,
    handler: Arc<dyn FaultHandler>,
) -> Relay {
    let (stop_tx, mut stop) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut forwarded: u64 = 0;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                Some(fault) = faults.recv() => handler.handle(&fault),
                Some(event) = events.recv() => match event {
                    Event::Fault(fault) => handler.handle(&fault),
                    Event::Record(record) => {
                        tokio::select! {
                            sent = out.send(record) => {
                                if sent.is_ok() {
                                    forwarded += 1;
                                }
                            }
                            _ = stop.changed() => break,
                        }
                    }
                },
                else => break,
            }
        }

        while let Ok(fault) = faults.try_recv() {
            handler.handle(&fault);
        }
        while let Ok(event) = events.try_recv() {
            if let Event::Fault(fault) = event {
                handler.handle(&fault);
            }
        }

        debug!(forwarded, "Relay stopped");
    });

    Relay {
        stop: stop_tx,
        handle,
    }
}

/// Builder for [`StreamConsumer`]
pub struct StreamConsumerBuilder {
    config: ConsumerConfig,
    client: Option<Arc<dyn StreamClient>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    handler: Option<Arc<dyn FaultHandler>>,
}

impl StreamConsumerBuilder {
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
            client: None,
            checkpointer: None,
            provisioner: None,
            handler: None,
        }
    }

    /// Set the stream name
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.config.stream = stream.into();
        self
    }

    /// Set the stream service client
    pub fn client(mut self, client: Arc<dyn StreamClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Persist progress and hold leases through this checkpointer
    pub fn checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Hold leases through a standalone provisioner instead of the checkpointer
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Route faults to `handler`
    pub fn fault_handler(mut self, handler: impl FaultHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Start partitions without a checkpoint `window` back in time
    pub fn replay(mut self, window: Duration) -> Self {
        self.config.poller.initial_position = InitialPosition::Replay(window);
        self
    }

    pub fn initial_position(mut self, position: InitialPosition) -> Self {
        self.config.poller.initial_position = position;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poller.poll_interval = interval;
        self
    }

    pub fn fetch_limit(mut self, limit: usize) -> Self {
        self.config.poller.fetch_limit = limit;
        self
    }

    pub fn lag_threshold(mut self, threshold: Duration) -> Self {
        self.config.poller.lag_threshold = threshold;
        self
    }

    pub fn output_buffer(mut self, capacity: usize) -> Self {
        self.config.output_buffer = capacity;
        self
    }

    pub fn iterator_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.poller.iterator_retry = policy;
        self
    }

    /// Stop a partition's poller when its lease moves to another worker
    pub fn stop_on_lease_loss(mut self, stop: bool) -> Self {
        self.config.poller.stop_on_lease_loss = stop;
        self
    }

    pub fn build(self) -> Result<StreamConsumer> {
        if self.config.stream.is_empty() {
            return Err(ConsumerError::Config("stream is required".to_string()));
        }
        if self.config.poller.fetch_limit == 0 {
            return Err(ConsumerError::Config("fetch_limit must be positive".to_string()));
        }
        if self.config.output_buffer == 0 {
            return Err(ConsumerError::Config(
                "output_buffer must be positive".to_string(),
            ));
        }

        let client = self
            .client
            .ok_or_else(|| ConsumerError::Config("client is required".to_string()))?;

        Ok(StreamConsumer {
            config: self.config,
            client,
            checkpointer: self
                .checkpointer
                .unwrap_or_else(|| Arc::new(NoopCheckpointer)),
            provisioner: self.provisioner,
            handler: self
                .handler
                .unwrap_or_else(|| Arc::new(DefaultFaultHandler)),
            state: tokio::sync::Mutex::new(ConsumerState::Created),
            records: Mutex::new(None),
            partitions: Mutex::new(Vec::new()),
        })
    }
}

impl Default for StreamConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Partitioned stream consumer with distributed leases and batched checkpoints.
//!
//! Workers in a fleet each run a [`StreamConsumer`] against the same stream
//! and the same key-value store. Leases make sure every partition is read by
//! one worker at a time; checkpoints let a restarted or rebalanced worker pick
//! up close to where the previous owner stopped. Delivery is at-least-once.
//!
//! ## Components
//!
//! - [`PartitionPoller`]: per-partition fetch loop with lag-aware pacing
//! - [`LeaseManager`]: standalone leases with leaky-bucket heartbeats
//! - [`KvCheckpointer`]: batched cursor persistence plus lease renewal
//! - [`StreamConsumer`]: discovery, orchestration and fault routing
//!
//! ## Architecture
//!
//! ```text
//!            ┌───────────────┐   ┌───────────────┐
//!            │ poller shard-0│   │ poller shard-1│  ...
//!            └──────┬────────┘   └──────┬────────┘
//!                   │ records + faults  │
//!                   ▼                   ▼
//!            ┌──────────────────────────────────┐      ┌──────────────┐
//!            │              relay               │─────▶│ FaultHandler │
//!            └──────────────┬───────────────────┘      └──────────────┘
//!                           ▼                                 ▲
//!                      Records ──▶ app ──done()──▶ checkpointer┘ faults
//!                                                    │
//!                                          HMSET / PEXPIRE (Redis)
//! ```

pub mod checkpoint;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod lease_manager;
pub mod poller;
pub mod record;
pub mod retry;

pub use checkpoint::{Checkpointer, CheckpointerOptions, KvCheckpointer, NoopCheckpointer};
pub use consumer::{ConsumerConfig, Records, StreamConsumer, StreamConsumerBuilder};
pub use error::{ConsumerError, LeaseError, LeaseResult, Result};
pub use handler::{log_fault, DefaultFaultHandler, FaultHandler, FaultSender, LoggingFaultHandler};
pub use lease_manager::{LeaseManager, Provisioner};
pub use poller::{InitialPosition, PartitionPoller, PollerChannels, PollerConfig, PollerState};
pub use record::{Ack, AckSender, Event, Record};
pub use retry::RetryPolicy;

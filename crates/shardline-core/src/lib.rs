//! Core types shared by every shardline crate.
//!
//! - [`record`]: partitions, service-level records, batches and iterator positions
//! - [`fault`]: severity-classified faults routed to the consumer's fault hook
//! - [`stream`]: the [`StreamClient`] trait every stream backend implements
//! - [`memory`]: an in-memory stream service used by tests and local runs

pub mod error;
pub mod fault;
pub mod memory;
pub mod record;
pub mod stream;

pub use error::{Result, StreamError};
pub use fault::{Fault, Severity};
pub use memory::MemoryStream;
pub use record::{IteratorPosition, Partition, RecordBatch, StreamRecord};
pub use stream::StreamClient;

//! In-memory stream service
//!
//! `MemoryStream` keeps every partition as a `Vec` of records and hands out
//! iterator tokens that point into it. It follows the service contract closely
//! enough to drive pollers end to end:
//!
//! - sequence numbers are zero-padded decimals, so lexical order matches write order
//! - a closed partition stops returning a next iterator once fully read
//! - fetches and iterator requests can be made to fail on demand
//!
//! ```rust
//! use shardline_core::{IteratorPosition, MemoryStream, StreamClient};
//!
//! # async fn example() -> shardline_core::Result<()> {
//! let stream = MemoryStream::new();
//! stream.create_stream("events", 2);
//! stream.put_record("events", "shard-0", "hello")?;
//!
//! let it = stream.get_iterator("events", "shard-0", IteratorPosition::Earliest).await?;
//! let batch = stream.fetch_records(&it, 100).await?;
//! assert_eq!(batch.records.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::{IteratorPosition, Partition, RecordBatch, Result, StreamClient, StreamError, StreamRecord};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Default)]
pub struct MemoryStream {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<PartitionLog>>,
    iterators: HashMap<String, IteratorState>,
    next_iterator_id: u64,
    next_sequence: u64,
    lag_ms: i64,
    failing_fetches: u32,
    failing_iterators: u32,
    fetch_count: u64,
    positions: Vec<(String, IteratorPosition)>,
}

struct PartitionLog {
    partition: Partition,
    records: Vec<StreamRecord>,
}

struct IteratorState {
    stream: String,
    partition_id: String,
    index: usize,
}

fn format_sequence(n: u64) -> String {
    format!("{n:020}")
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Inner {
    fn partition_mut(&mut self, stream: &str, partition_id: &str) -> Result<&mut PartitionLog> {
        self.streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::StreamNotFound(stream.to_string()))?
            .iter_mut()
            .find(|log| log.partition.id == partition_id)
            .ok_or_else(|| StreamError::PartitionNotFound {
                stream: stream.to_string(),
                partition: partition_id.to_string(),
            })
    }

    fn issue_iterator(&mut self, stream: &str, partition_id: &str, index: usize) -> String {
        self.next_iterator_id += 1;
        let token = format!("it-{}", self.next_iterator_id);
        self.iterators.insert(
            token.clone(),
            IteratorState {
                stream: stream.to_string(),
                partition_id: partition_id.to_string(),
                index,
            },
        );
        token
    }
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a stream with `partitions` open partitions named `shard-0..N`.
    pub fn create_stream(&self, stream: &str, partitions: usize) {
        let mut inner = self.lock();
        let start = format_sequence(inner.next_sequence);
        let logs = (0..partitions)
            .map(|i| PartitionLog {
                partition: Partition::new(format!("shard-{i}"), start.clone()),
                records: Vec::new(),
            })
            .collect();
        inner.streams.insert(stream.to_string(), logs);
    }

    /// Append a record to an open partition, returning its sequence number.
    pub fn put_record(
        &self,
        stream: &str,
        partition_id: &str,
        data: impl Into<Bytes>,
    ) -> Result<String> {
        self.put_record_at(stream, partition_id, data, now_ms())
    }

    /// Append a record with an explicit arrival time (ms since epoch).
    pub fn put_record_at(
        &self,
        stream: &str,
        partition_id: &str,
        data: impl Into<Bytes>,
        arrival_ms: i64,
    ) -> Result<String> {
        let mut inner = self.lock();
        inner.next_sequence += 1;
        let sequence = format_sequence(inner.next_sequence);
        let log = inner.partition_mut(stream, partition_id)?;
        if !log.partition.is_open() {
            return Err(StreamError::Service(format!(
                "partition {partition_id} is closed"
            )));
        }
        log.records.push(StreamRecord {
            data: data.into(),
            partition_key: partition_id.to_string(),
            sequence_number: sequence.clone(),
            approximate_arrival_ms: Some(arrival_ms),
        });
        Ok(sequence)
    }

    /// Close a partition at its last written record.
    pub fn close_partition(&self, stream: &str, partition_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let log = inner.partition_mut(stream, partition_id)?;
        let end = log
            .records
            .last()
            .map(|r| r.sequence_number.clone())
            .unwrap_or_else(|| log.partition.starting_sequence.clone());
        log.partition.ending_sequence = Some(end);
        Ok(())
    }

    /// Lag reported by every subsequent fetch.
    pub fn set_lag(&self, millis_behind_latest: i64) {
        self.lock().lag_ms = millis_behind_latest;
    }

    /// Make the next `n` fetches fail with a service error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.lock().failing_fetches = n;
    }

    /// Make the next `n` iterator requests fail with a service error.
    pub fn fail_next_iterators(&self, n: u32) {
        self.lock().failing_iterators = n;
    }

    /// Number of fetch calls served so far, failed ones included.
    pub fn fetch_count(&self) -> u64 {
        self.lock().fetch_count
    }

    /// Every iterator position requested so far, by partition.
    pub fn iterator_requests(&self) -> Vec<(String, IteratorPosition)> {
        self.lock().positions.clone()
    }
}

#[async_trait]
impl StreamClient for MemoryStream {
    async fn list_partitions(&self, stream: &str) -> Result<Vec<Partition>> {
        let inner = self.lock();
        let logs = inner
            .streams
            .get(stream)
            .ok_or_else(|| StreamError::StreamNotFound(stream.to_string()))?;
        Ok(logs.iter().map(|log| log.partition.clone()).collect())
    }

    async fn get_iterator(
        &self,
        stream: &str,
        partition_id: &str,
        position: IteratorPosition,
    ) -> Result<String> {
        let mut inner = self.lock();
        inner
            .positions
            .push((partition_id.to_string(), position.clone()));
        if inner.failing_iterators > 0 {
            inner.failing_iterators -= 1;
            return Err(StreamError::Service("injected iterator failure".into()));
        }

        let log = inner.partition_mut(stream, partition_id)?;
        let index = match &position {
            IteratorPosition::Earliest => 0,
            IteratorPosition::Latest => log.records.len(),
            IteratorPosition::AfterSequence(seq) => log
                .records
                .iter()
                .position(|r| r.sequence_number.as_str() > seq.as_str())
                .unwrap_or(log.records.len()),
            IteratorPosition::AtTimestamp(ts) => {
                let ms = ts
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                log.records
                    .iter()
                    .position(|r| r.approximate_arrival_ms.unwrap_or(0) >= ms)
                    .unwrap_or(log.records.len())
            }
        };
        Ok(inner.issue_iterator(stream, partition_id, index))
    }

    async fn fetch_records(&self, iterator: &str, limit: usize) -> Result<RecordBatch> {
        let mut inner = self.lock();
        inner.fetch_count += 1;
        if inner.failing_fetches > 0 {
            inner.failing_fetches -= 1;
            return Err(StreamError::Service("injected fetch failure".into()));
        }

        let state = inner
            .iterators
            .remove(iterator)
            .ok_or_else(|| StreamError::UnknownIterator(iterator.to_string()))?;
        let lag_ms = inner.lag_ms;
        let log = inner.partition_mut(&state.stream, &state.partition_id)?;

        let end = (state.index + limit).min(log.records.len());
        let records = log.records[state.index..end].to_vec();
        let exhausted = !log.partition.is_open() && end >= log.records.len();

        let next_iterator = if exhausted {
            None
        } else {
            Some(inner.issue_iterator(&state.stream, &state.partition_id, end))
        };

        Ok(RecordBatch {
            records,
            next_iterator,
            millis_behind_latest: lag_ms,
        })
    }
}

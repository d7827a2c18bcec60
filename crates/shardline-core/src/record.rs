//! Partition and record shapes returned by a stream service
//!
//! A stream is split into partitions. Each partition is an ordered,
//! append-only log addressed by opaque sequence numbers ("cursors"). Cursors
//! are only comparable within one partition.
//!
//! A partition that has been closed by a resharding event carries an ending
//! cursor; once a reader has delivered that cursor the partition is exhausted.

use bytes::Bytes;
use std::time::SystemTime;

/// A partition discovered on the stream. Immutable once listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Partition identifier (e.g. `shardId-000000000000`)
    pub id: String,

    /// First cursor the partition ever held
    pub starting_sequence: String,

    /// Last cursor of a closed partition, `None` while the partition is open
    pub ending_sequence: Option<String>,
}

impl Partition {
    pub fn new(id: impl Into<String>, starting_sequence: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            starting_sequence: starting_sequence.into(),
            ending_sequence: None,
        }
    }

    pub fn closed(mut self, ending_sequence: impl Into<String>) -> Self {
        self.ending_sequence = Some(ending_sequence.into());
        self
    }

    pub fn is_open(&self) -> bool {
        self.ending_sequence.is_none()
    }
}

/// A record as returned by the stream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    /// Opaque payload
    pub data: Bytes,

    /// Key the producer used to route the record to its partition
    pub partition_key: String,

    /// Cursor of this record within its partition
    pub sequence_number: String,

    /// Approximate arrival time, milliseconds since epoch
    pub approximate_arrival_ms: Option<i64>,
}

/// One page of records plus the iterator for the next page.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<StreamRecord>,

    /// `None` once a closed partition has been read to its end
    pub next_iterator: Option<String>,

    /// How far the returned page trails the tip of the partition
    pub millis_behind_latest: i64,
}

/// Where a new iterator should start reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    /// Oldest record still retained (`TRIM_HORIZON`)
    Earliest,
    /// Only records written after the iterator is created (`LATEST`)
    Latest,
    /// Immediately after the given cursor (`AFTER_SEQUENCE_NUMBER`)
    AfterSequence(String),
    /// First record that arrived at or after the given time (`AT_TIMESTAMP`)
    AtTimestamp(SystemTime),
}

impl IteratorPosition {
    /// Short name used in log lines and faults.
    pub fn describe(&self) -> String {
        match self {
            IteratorPosition::Earliest => "earliest".to_string(),
            IteratorPosition::Latest => "latest".to_string(),
            IteratorPosition::AfterSequence(seq) => format!("after {seq}"),
            IteratorPosition::AtTimestamp(ts) => {
                let ms = ts
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                format!("timestamp {ms}ms")
            }
        }
    }
}

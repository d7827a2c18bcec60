//! Records handed to the application
//!
//! A [`Record`] carries the payload plus a write-only handle into the
//! checkpointer. Calling [`Record::done`] marks the record as processed; the
//! checkpointer picks the cursor up on its next save. Records that are never
//! acknowledged are redelivered after a restart (at-least-once).

use crate::error::{ConsumerError, Result};
use bytes::Bytes;
use shardline_core::{Fault, StreamRecord};
use tokio::sync::mpsc;

/// Acknowledgment of one processed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub partition_id: String,
    pub sequence_number: String,
}

/// Producer side of a checkpointer's acknowledgment channel.
pub type AckSender = mpsc::Sender<Ack>;

/// A record read from one partition.
#[derive(Debug, Clone)]
pub struct Record {
    /// Opaque payload
    pub data: Bytes,

    pub partition_key: String,

    /// Cursor of this record within its partition
    pub sequence_number: String,

    /// Partition the record was read from
    pub partition_id: String,

    /// Lag observed by the fetch that returned this record
    pub millis_behind_latest: i64,

    ack: Option<AckSender>,
}

impl Record {
    pub fn new(
        record: StreamRecord,
        partition_id: impl Into<String>,
        millis_behind_latest: i64,
        ack: Option<AckSender>,
    ) -> Self {
        Self {
            data: record.data,
            partition_key: record.partition_key,
            sequence_number: record.sequence_number,
            partition_id: partition_id.into(),
            millis_behind_latest,
            ack,
        }
    }

    /// Acknowledge this record.
    ///
    /// Blocks while the checkpointer's channel is full. A no-op when the
    /// consumer runs without checkpoints.
    pub async fn done(&self) -> Result<()> {
        let Some(ack) = &self.ack else {
            return Ok(());
        };
        ack.send(Ack {
            partition_id: self.partition_id.clone(),
            sequence_number: self.sequence_number.clone(),
        })
        .await
        .map_err(|_| ConsumerError::AckChannelClosed)
    }

    /// Whether [`done`](Self::done) reaches a checkpointer.
    pub fn is_ackable(&self) -> bool {
        self.ack.is_some()
    }
}

/// What a poller emits: a record or a fault, never both.
#[derive(Debug)]
pub enum Event {
    Record(Record),
    Fault(Fault),
}

//! Stream service abstraction
//!
//! Pollers talk to the remote log exclusively through [`StreamClient`]. The
//! Kinesis adapter lives in `shardline-kinesis`; [`MemoryStream`](crate::MemoryStream)
//! implements the same contract in process.

use crate::{IteratorPosition, Partition, RecordBatch, Result};
use async_trait::async_trait;

#[async_trait]
pub trait StreamClient: Send + Sync {
    /// List every partition of the stream, open and closed.
    async fn list_partitions(&self, stream: &str) -> Result<Vec<Partition>>;

    /// Obtain an iterator token for one partition.
    ///
    /// Tokens are single-use: every [`fetch_records`](Self::fetch_records)
    /// call returns the token for the following page.
    async fn get_iterator(
        &self,
        stream: &str,
        partition_id: &str,
        position: IteratorPosition,
    ) -> Result<String>;

    /// Fetch up to `limit` records starting at `iterator`.
    async fn fetch_records(&self, iterator: &str, limit: usize) -> Result<RecordBatch>;
}

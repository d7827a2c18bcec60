//! Amazon Kinesis adapter
//!
//! [`KinesisStream`] implements [`StreamClient`] on top of the AWS SDK:
//!
//! | StreamClient       | Kinesis API        |
//! |--------------------|--------------------|
//! | `list_partitions`  | `ListShards`       |
//! | `get_iterator`     | `GetShardIterator` |
//! | `fetch_records`    | `GetRecords`       |
//!
//! Credentials and region come from the standard AWS provider chain.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kinesis::error::{DisplayErrorContext, SdkError};
use aws_sdk_kinesis::operation::get_records::GetRecordsError;
use aws_sdk_kinesis::operation::get_shard_iterator::GetShardIteratorError;
use aws_sdk_kinesis::operation::list_shards::ListShardsError;
use aws_sdk_kinesis::primitives::DateTime;
use aws_sdk_kinesis::types::{Record, Shard, ShardIteratorType};
use aws_sdk_kinesis::Client;
use bytes::Bytes;
use shardline_core::{
    IteratorPosition, Partition, RecordBatch, Result, StreamClient, StreamError, StreamRecord,
};
use tracing::{debug, trace};

/// Connection settings for [`KinesisStream::connect`].
#[derive(Debug, Clone, Default)]
pub struct KinesisOptions {
    /// AWS region, falls back to the provider chain when unset
    pub region: Option<String>,

    /// Custom endpoint (e.g. LocalStack)
    pub endpoint_url: Option<String>,
}

/// Kinesis Data Streams client.
#[derive(Debug, Clone)]
pub struct KinesisStream {
    client: Client,
}

impl KinesisStream {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the default AWS configuration chain.
    pub async fn connect(options: KinesisOptions) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = options.region {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(endpoint) = options.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        debug!(region = ?config.region(), "Kinesis client configured");
        Self::new(Client::new(&config))
    }
}

#[async_trait]
impl StreamClient for KinesisStream {
    async fn list_partitions(&self, stream: &str) -> Result<Vec<Partition>> {
        let mut partitions = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // ListShards rejects a stream name alongside a pagination token
            let request = match &next_token {
                Some(token) => self.client.list_shards().next_token(token),
                None => self.client.list_shards().stream_name(stream),
            };
            let output = request
                .send()
                .await
                .map_err(|e| map_list_error(stream, e))?;

            partitions.extend(output.shards().iter().filter_map(to_partition));

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(stream = %stream, shards = partitions.len(), "Listed shards");
        Ok(partitions)
    }

    async fn get_iterator(
        &self,
        stream: &str,
        partition_id: &str,
        position: IteratorPosition,
    ) -> Result<String> {
        let (iterator_type, sequence, timestamp) = iterator_request(&position);
        let output = self
            .client
            .get_shard_iterator()
            .stream_name(stream)
            .shard_id(partition_id)
            .shard_iterator_type(iterator_type)
            .set_starting_sequence_number(sequence)
            .set_timestamp(timestamp)
            .send()
            .await
            .map_err(|e| map_iterator_error(stream, partition_id, e))?;

        output
            .shard_iterator()
            .map(str::to_string)
            .ok_or_else(|| {
                StreamError::Service(format!("no iterator returned for {stream}/{partition_id}"))
            })
    }

    async fn fetch_records(&self, iterator: &str, limit: usize) -> Result<RecordBatch> {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let output = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(map_records_error)?;

        let records: Vec<StreamRecord> = output.records().iter().map(to_stream_record).collect();
        trace!(records = records.len(), "GetRecords");

        Ok(RecordBatch {
            records,
            next_iterator: output.next_shard_iterator().map(str::to_string),
            millis_behind_latest: output.millis_behind_latest().unwrap_or(0),
        })
    }
}

/// Iterator type plus the optional cursor or timestamp it needs.
fn iterator_request(
    position: &IteratorPosition,
) -> (ShardIteratorType, Option<String>, Option<DateTime>) {
    match position {
        IteratorPosition::Earliest => (ShardIteratorType::TrimHorizon, None, None),
        IteratorPosition::Latest => (ShardIteratorType::Latest, None, None),
        IteratorPosition::AfterSequence(seq) => {
            (ShardIteratorType::AfterSequenceNumber, Some(seq.clone()), None)
        }
        IteratorPosition::AtTimestamp(at) => (
            ShardIteratorType::AtTimestamp,
            None,
            Some(DateTime::from(*at)),
        ),
    }
}

fn to_partition(shard: &Shard) -> Option<Partition> {
    let range = shard.sequence_number_range()?;
    let partition = Partition::new(shard.shard_id(), range.starting_sequence_number());
    Some(match range.ending_sequence_number() {
        Some(end) => partition.closed(end),
        None => partition,
    })
}

fn to_stream_record(record: &Record) -> StreamRecord {
    StreamRecord {
        data: Bytes::copy_from_slice(record.data().as_ref()),
        partition_key: record.partition_key().to_string(),
        sequence_number: record.sequence_number().to_string(),
        approximate_arrival_ms: record
            .approximate_arrival_timestamp()
            .and_then(|at| at.to_millis().ok()),
    }
}

fn map_list_error(stream: &str, err: SdkError<ListShardsError>) -> StreamError {
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::ServiceError(ctx) => match ctx.into_err() {
            ListShardsError::ResourceNotFoundException(_) => {
                StreamError::StreamNotFound(stream.to_string())
            }
            ListShardsError::LimitExceededException(_) => StreamError::Throttled(message),
            _ => StreamError::Service(message),
        },
        _ => StreamError::Service(message),
    }
}

fn map_iterator_error(
    stream: &str,
    partition_id: &str,
    err: SdkError<GetShardIteratorError>,
) -> StreamError {
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::ServiceError(ctx) => match ctx.into_err() {
            GetShardIteratorError::ResourceNotFoundException(_) => StreamError::PartitionNotFound {
                stream: stream.to_string(),
                partition: partition_id.to_string(),
            },
            GetShardIteratorError::ProvisionedThroughputExceededException(_) => {
                StreamError::Throttled(message)
            }
            _ => StreamError::Service(message),
        },
        _ => StreamError::Service(message),
    }
}

fn map_records_error(err: SdkError<GetRecordsError>) -> StreamError {
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::ServiceError(ctx) => match ctx.into_err() {
            GetRecordsError::ExpiredIteratorException(_) => StreamError::ExpiredIterator(message),
            GetRecordsError::ProvisionedThroughputExceededException(_)
            | GetRecordsError::KmsThrottlingException(_) => StreamError::Throttled(message),
            _ => StreamError::Service(message),
        },
        _ => StreamError::Service(message),
    }
}

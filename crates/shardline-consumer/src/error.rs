//! Error types for the shardline consumer

use shardline_core::StreamError;
use shardline_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConsumerError>;

pub type LeaseResult<T> = std::result::Result<T, LeaseError>;

/// Lease (partition ownership) failures.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("Lease for partition {0} already acquired by this process")]
    AlreadyHeldLocally(String),

    #[error("Failed to acquire lease for partition {0}")]
    AcquireFailed(String),

    #[error("Bad lock for partition {0}: token does not match")]
    BadLock(String),

    #[error("Lock changed for partition {0}: held by another process")]
    LockChanged(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Consumer already started")]
    AlreadyStarted,

    #[error("Consumer already stopped")]
    Stopped,

    #[error("Partition discovery failed for stream {stream}: {source}")]
    Discovery {
        stream: String,
        #[source]
        source: StreamError,
    },

    #[error("Could not obtain an iterator for partition {partition}: {source}")]
    IteratorUnavailable {
        partition: String,
        #[source]
        source: StreamError,
    },

    #[error("Failed to load checkpoints: {0}")]
    CheckpointLoad(#[source] StoreError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint channel closed")]
    AckChannelClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

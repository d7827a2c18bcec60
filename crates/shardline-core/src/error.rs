//! Error types for stream service access
//!
//! Every [`StreamClient`](crate::StreamClient) operation returns [`Result<T>`].
//! Pollers treat all of these as transient: the failure is forwarded as a
//! fault and the iterator is re-acquired.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream does not exist (or is not visible to these credentials).
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// The partition is not part of the stream.
    #[error("Partition not found: {stream}/{partition}")]
    PartitionNotFound { stream: String, partition: String },

    /// The iterator token was never issued by this service.
    #[error("Unknown iterator: {0}")]
    UnknownIterator(String),

    /// The iterator outlived its validity window and must be re-acquired.
    #[error("Iterator expired: {0}")]
    ExpiredIterator(String),

    /// The service rejected the call for exceeding provisioned throughput.
    #[error("Throughput exceeded: {0}")]
    Throttled(String),

    /// Any other service-side or transport failure.
    #[error("Stream service error: {0}")]
    Service(String),
}

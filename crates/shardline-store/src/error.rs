//! Error types for key-value store access

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection, protocol or server error from Redis.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A command was issued against a key holding the wrong kind of value.
    #[error("Wrong type for key {0}")]
    WrongType(String),
}

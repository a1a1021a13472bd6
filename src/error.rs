// for error definitions
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// Errors related to the counter store
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Configuration-related errors, including malformed endpoint patterns
    #[error("Configuration error: {0}")]
    Config(String),

    /// Algorithm-specific errors
    #[error("Algorithm error: {0}")]
    Algorithm(String),

    /// The counter store did not answer within the configured bound
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// Unexpected or internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Redis connection errors
    #[error("Redis connection error: {0}")]
    RedisConnection(String),

    // Redis authentication errors
    #[error("Redis authentication error: {0}")]
    RedisAuth(String),

    /// Redis command errors
    #[error("Redis command error: {0}")]
    RedisCommand(String),

    /// Stored value has the wrong shape for the requested operation
    #[error("Data serialization error: {0}")]
    Serialization(String),

    /// In-process store refused a new key
    #[error("Maximum entries limit exceeded ({0})")]
    CapacityExceeded(usize),
}

impl RateLimiterError {
    /// Whether the error means the store is unreachable or misbehaving.
    ///
    /// A full in-process store is not an outage: it still answers for keys it
    /// already holds, so it must not count towards opening the circuit.
    pub fn is_outage(&self) -> bool {
        match self {
            Self::Storage(StorageError::CapacityExceeded(_)) => false,
            Self::Storage(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }
}

// Implement conversions from redis::RedisError to StorageError
impl From<redis::RedisError> for RateLimiterError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::AuthenticationFailed => {
                RateLimiterError::Storage(StorageError::RedisAuth(err.to_string()))
            }
            redis::ErrorKind::IoError | redis::ErrorKind::ClientError => {
                RateLimiterError::Storage(StorageError::RedisConnection(err.to_string()))
            }
            redis::ErrorKind::TypeError => {
                RateLimiterError::Storage(StorageError::Serialization(err.to_string()))
            }
            _ => RateLimiterError::Storage(StorageError::RedisCommand(err.to_string())),
        }
    }
}

// config files are JSON
impl From<serde_json::Error> for RateLimiterError {
    fn from(err: serde_json::Error) -> Self {
        RateLimiterError::Config(err.to_string())
    }
}

impl From<std::io::Error> for RateLimiterError {
    fn from(err: std::io::Error) -> Self {
        RateLimiterError::Config(err.to_string())
    }
}

impl From<StorageError> for RateLimiterError {
    fn from(err: StorageError) -> Self {
        RateLimiterError::Storage(err)
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, RateLimiterError>;

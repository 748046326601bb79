//! Error types for the connection fabric.

use thiserror::Error;

/// Failures of the shared key-value/pub-sub store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Store is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum FabricError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Connection already registered: {0}")]
    DuplicateConnection(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fabric already started")]
    AlreadyStarted,

    #[error("Fabric is shut down")]
    ShutDown,
}

impl FabricError {
    /// Transient errors are logged and retried by the background sweeps.
    pub fn is_transient(&self) -> bool {
        matches!(self, FabricError::Store(StoreError::Unavailable(_)))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type Result<T> = std::result::Result<T, FabricError>;

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

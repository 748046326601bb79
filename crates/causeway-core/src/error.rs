//! Error types for the core primitives.

use thiserror::Error;

/// Errors raised by clocks, pointers and checksum computation.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid vector clock: {0}")]
    InvalidClock(String),

    #[error("Invalid JSON pointer: {0}")]
    InvalidPointer(String),

    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

//! Error types for the delta protocol.

use causeway_core::CoreError;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while validating or applying a single patch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatchError {
    #[error("Invalid patch at index {index}: {reason}")]
    Validation { index: usize, reason: String },

    #[error("Invalid JSON pointer: {0}")]
    InvalidPointer(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Invalid array index '{token}' at {path}")]
    InvalidIndex { path: String, token: String },

    #[error("Type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("Cannot move {from} into its own child {path}")]
    InvalidMove { from: String, path: String },

    #[error("Not applied: batch aborted by failure of patch {cause_index}")]
    Aborted { cause_index: usize },

    #[error("Test failed at {path}: expected {expected}, actual {actual:?}")]
    TestFailed {
        path: String,
        expected: Value,
        actual: Option<Value>,
    },
}

impl PatchError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            PatchError::Validation { .. } => "VALIDATION_ERROR",
            PatchError::TestFailed { .. } => "TEST_FAILED",
            _ => "APPLICATION_ERROR",
        }
    }
}

impl From<CoreError> for PatchError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidPointer(p) => PatchError::InvalidPointer(p),
            other => PatchError::InvalidPointer(other.to_string()),
        }
    }
}

/// Errors raised by the sync engine and its wire formats.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Checksum mismatch for message {message_id}: expected {expected}, computed {actual}")]
    InvalidChecksum {
        message_id: String,
        expected: String,
        actual: String,
    },

    #[error("Message {message_id} was built against version {base}, local version is {local}")]
    VersionMismatch {
        message_id: String,
        base: String,
        local: String,
    },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Patch(#[from] PatchError),
}

impl SyncError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::InvalidChecksum { .. } => "INVALID_CHECKSUM",
            SyncError::VersionMismatch { .. } => "VERSION_MISMATCH",
            SyncError::Compression(_) => "COMPRESSION_ERROR",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SyncError::Patch(e) => e.code(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

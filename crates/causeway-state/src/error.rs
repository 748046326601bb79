//! Error types for the state store.

use causeway_core::CoreError;
use causeway_delta::SyncError;
use thiserror::Error;

/// Errors that can occur during snapshot operations.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot {id} depends on missing base {base}")]
    BrokenChain { id: String, base: String },

    #[error("Snapshot chain starting at {0} loops back on itself")]
    CyclicChain(String),

    #[error("Checksum mismatch restoring snapshot {id}: expected {expected}, computed {actual}")]
    InvalidChecksum {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Serialization(err.to_string())
    }
}

impl From<CoreError> for SnapshotError {
    fn from(err: CoreError) -> Self {
        SnapshotError::Serialization(err.to_string())
    }
}

/// Errors raised by the state manager and version controller.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State not found: {0}")]
    NotFound(String),

    #[error("Checksum mismatch for state {state_id}: expected {expected}, computed {actual}")]
    InvalidChecksum {
        state_id: String,
        expected: String,
        actual: String,
    },

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Cannot delete the active branch: {0}")]
    ActiveBranch(String),

    #[error("Refusing to write through reserved key '{key}' at {path}")]
    ReservedKey { path: String, key: String },

    #[error("{0} conflict(s) left unresolved")]
    UnresolvedConflicts(usize),

    #[error("Migration from schema {from} to {to} failed: {reason}")]
    Migration { from: u32, to: u32, reason: String },

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl StateError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            StateError::NotFound(_) => "NOT_FOUND",
            StateError::InvalidChecksum { .. } => "INVALID_CHECKSUM",
            StateError::BranchNotFound(_) => "BRANCH_NOT_FOUND",
            StateError::BranchExists(_) | StateError::ActiveBranch(_) => "BRANCH_ERROR",
            StateError::ReservedKey { .. } => "VALIDATION_ERROR",
            StateError::UnresolvedConflicts(_) => "MERGE_CONFLICT",
            StateError::Migration { .. } => "MIGRATION_ERROR",
            StateError::Snapshot(SnapshotError::InvalidChecksum { .. }) => "INVALID_CHECKSUM",
            StateError::Snapshot(_) => "SNAPSHOT_ERROR",
            StateError::Sync(e) => e.code(),
            StateError::Core(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

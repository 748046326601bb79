//! Immutable, vector-clock versioned state records.

use crate::error::{Result, StateError};
use causeway_core::{new_id, now_millis, Checksum, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One version of a document.
///
/// Never mutated after construction; every change produces a new record with
/// a fresh id. `checksum` is the SHA-256 of `data` and is what remote records
/// are verified against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedState {
    pub id: String,
    pub version: VectorClock,
    pub data: Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<VectorClock>,
    pub checksum: Checksum,
}

impl VersionedState {
    /// Build a record, computing id, timestamp and checksum.
    pub fn new(version: VectorClock, data: Value, parent_version: Option<VectorClock>) -> Result<Self> {
        let checksum = Checksum::of(&data)?;
        Ok(VersionedState {
            id: new_id(),
            version,
            data,
            timestamp: now_millis(),
            parent_version,
            checksum,
        })
    }

    /// A root record: `{writer: 0}`, no parent.
    pub fn root(writer_id: &str, data: Value) -> Result<Self> {
        Self::new(VectorClock::for_writer(writer_id), data, None)
    }

    /// The record that follows this one when `writer_id` produces `data`.
    pub fn child(&self, writer_id: &str, data: Value) -> Result<Self> {
        Self::new(
            self.version.increment(writer_id),
            data,
            Some(self.version.clone()),
        )
    }

    /// Check `checksum` against `data`.
    pub fn verify(&self) -> Result<()> {
        let actual = Checksum::of(&self.data)?;
        if actual == self.checksum {
            Ok(())
        } else {
            Err(StateError::InvalidChecksum {
                state_id: self.id.clone(),
                expected: self.checksum.to_hex(),
                actual: actual.to_hex(),
            })
        }
    }

    pub fn is_intact(&self) -> bool {
        self.verify().is_ok()
    }
}

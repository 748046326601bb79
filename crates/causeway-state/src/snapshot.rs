//! Snapshot management for state persistence.
//!
//! A snapshot is either a full copy of a document or an incremental delta
//! on top of a base snapshot. Restoring walks the chain of bases back to the
//! nearest full snapshot and folds the deltas forward. Snapshots that are a
//! base of a retained snapshot are never pruned.

use crate::error::SnapshotError;
use crate::state::VersionedState;
use causeway_core::value::deep_equal;
use causeway_core::{new_id, now_millis, Checksum, VectorClock};
use causeway_delta::{CompressedData, PatchCompressor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A change to one object field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldChange {
    Set(Value),
    Remove,
    Nested(BTreeMap<String, FieldChange>),
}

/// Partial-object difference between two documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotDelta {
    /// Either side is not an object.
    Replace(Value),
    Fields(BTreeMap<String, FieldChange>),
}

impl SnapshotDelta {
    /// The delta turning `base` into `target`.
    pub fn between(base: &Value, target: &Value) -> Self {
        match (base, target) {
            (Value::Object(b), Value::Object(t)) => SnapshotDelta::Fields(diff_fields(b, t)),
            _ => SnapshotDelta::Replace(target.clone()),
        }
    }

    pub fn apply(&self, base: &Value) -> Value {
        match self {
            SnapshotDelta::Replace(value) => value.clone(),
            SnapshotDelta::Fields(changes) => {
                let mut out = base.clone();
                apply_fields(&mut out, changes);
                out
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, SnapshotDelta::Fields(changes) if changes.is_empty())
    }
}

fn diff_fields(base: &Map<String, Value>, target: &Map<String, Value>) -> BTreeMap<String, FieldChange> {
    let mut changes = BTreeMap::new();
    for (key, value) in target {
        match base.get(key) {
            Some(old) if deep_equal(old, value) => {}
            Some(Value::Object(old)) if value.is_object() => {
                if let Value::Object(new) = value {
                    changes.insert(key.clone(), FieldChange::Nested(diff_fields(old, new)));
                }
            }
            _ => {
                changes.insert(key.clone(), FieldChange::Set(value.clone()));
            }
        }
    }
    for key in base.keys() {
        if !target.contains_key(key) {
            changes.insert(key.clone(), FieldChange::Remove);
        }
    }
    changes
}

fn apply_fields(doc: &mut Value, changes: &BTreeMap<String, FieldChange>) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let Value::Object(map) = doc else { return };
    for (key, change) in changes {
        match change {
            FieldChange::Set(value) => {
                map.insert(key.clone(), value.clone());
            }
            FieldChange::Remove => {
                map.remove(key);
            }
            FieldChange::Nested(inner) => {
                let child = map.entry(key.clone()).or_insert(Value::Null);
                apply_fields(child, inner);
            }
        }
    }
}

/// Stored form of a snapshot's contents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SnapshotBody {
    Full { data: Value },
    Delta { delta: SnapshotDelta },
    /// A delta serialized and compressed (base64 zlib).
    CompressedDelta { blob: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub id: String,
    pub version: VectorClock,
    pub body: SnapshotBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_snapshot_id: Option<String>,
    pub compressed: bool,
    /// SHA-256 of the fully resolved document.
    pub checksum: Checksum,
    pub state_id: String,
    pub created_at: i64,
    /// Creation order within the manager.
    pub sequence: u64,
}

impl StateSnapshot {
    pub fn is_full(&self) -> bool {
        matches!(self.body, SnapshotBody::Full { .. })
    }

    /// Approximate stored size in bytes.
    pub fn size(&self) -> usize {
        match &self.body {
            SnapshotBody::CompressedDelta { blob } => blob.len(),
            SnapshotBody::Full { data } => serde_json::to_string(data).map_or(0, |s| s.len()),
            SnapshotBody::Delta { delta } => serde_json::to_string(delta).map_or(0, |s| s.len()),
        }
    }
}

/// A document recovered from a snapshot chain.
#[derive(Clone, Debug, PartialEq)]
pub struct RestoredSnapshot {
    pub snapshot_id: String,
    pub version: VectorClock,
    pub data: Value,
}

/// Configuration for snapshot management.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Updates between automatic snapshots.
    pub interval: u64,
    /// Store deltas against a base instead of full copies.
    pub incremental: bool,
    /// Deltas serializing above this many bytes are compressed.
    pub compression_threshold: usize,
    /// Snapshots kept by automatic pruning, 0 disables pruning.
    pub max_snapshots: usize,
    /// Incremental chains longer than this start over with a full snapshot.
    pub max_chain_length: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            interval: 10,
            incremental: true,
            compression_threshold: 1024,
            max_snapshots: 0,
            max_chain_length: 16,
        }
    }
}

/// Statistics about managed snapshots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SnapshotStats {
    pub count: usize,
    pub full: usize,
    pub incremental: usize,
    pub compressed: usize,
    pub total_size: usize,
}

/// Manages snapshot creation, restoration and pruning.
pub struct SnapshotManager {
    snapshots: HashMap<String, StateSnapshot>,
    latest: Option<String>,
    counter: u64,
    next_sequence: u64,
    compressor: PatchCompressor,
    config: SnapshotConfig,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::with_config(SnapshotConfig::default())
    }

    pub fn with_config(config: SnapshotConfig) -> Self {
        let compressor = PatchCompressor::with_config(causeway_delta::CompressionConfig {
            threshold: config.compression_threshold,
            ..Default::default()
        });
        SnapshotManager {
            snapshots: HashMap::new(),
            latest: None,
            counter: 0,
            next_sequence: 0,
            compressor,
            config,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Count one update; true once `interval` updates accumulated since the
    /// last snapshot.
    pub fn should_create_snapshot(&mut self) -> bool {
        self.counter += 1;
        self.counter >= self.config.interval.max(1)
    }

    /// Snapshot `state`, as a delta against `base_snapshot_id` when given and
    /// incremental snapshots are enabled.
    pub fn create_snapshot(
        &mut self,
        state: &VersionedState,
        base_snapshot_id: Option<&str>,
    ) -> Result<String, SnapshotError> {
        let base = match base_snapshot_id {
            Some(base_id) if self.config.incremental => {
                if self.chain_length(base_id)? >= self.config.max_chain_length {
                    None
                } else {
                    Some((base_id.to_string(), self.restore_from_snapshot(base_id)?))
                }
            }
            _ => None,
        };

        let (body, base_snapshot_id, compressed) = match base {
            None => (
                SnapshotBody::Full {
                    data: state.data.clone(),
                },
                None,
                false,
            ),
            Some((base_id, restored)) => {
                let delta = SnapshotDelta::between(&restored.data, &state.data);
                let text = serde_json::to_string(&delta)?;
                let packed = self.compressor.compress_str(&text);
                if packed.compressed {
                    (SnapshotBody::CompressedDelta { blob: packed.data }, Some(base_id), true)
                } else {
                    (SnapshotBody::Delta { delta }, Some(base_id), false)
                }
            }
        };

        let snapshot = StateSnapshot {
            id: new_id(),
            version: state.version.clone(),
            body,
            base_snapshot_id,
            compressed,
            checksum: Checksum::of(&state.data)?,
            state_id: state.id.clone(),
            created_at: now_millis(),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.counter = 0;

        let id = snapshot.id.clone();
        tracing::debug!(
            snapshot_id = %id,
            version = %snapshot.version,
            incremental = snapshot.base_snapshot_id.is_some(),
            compressed,
            "created snapshot"
        );
        self.snapshots.insert(id.clone(), snapshot);
        self.latest = Some(id.clone());

        if self.config.max_snapshots > 0 {
            self.prune_snapshots(self.config.max_snapshots);
        }
        Ok(id)
    }

    /// Number of snapshots from `id` back to (and including) its full base.
    fn chain_length(&self, id: &str) -> Result<usize, SnapshotError> {
        Ok(self.chain(id)?.len())
    }

    /// Ids from `id` back to the nearest full snapshot, newest first.
    fn chain(&self, id: &str) -> Result<Vec<&StateSnapshot>, SnapshotError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self
            .snapshots
            .get(id)
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        loop {
            if !seen.insert(current.id.as_str()) {
                return Err(SnapshotError::CyclicChain(id.to_string()));
            }
            chain.push(current);
            let Some(base_id) = current.base_snapshot_id.as_deref() else {
                break;
            };
            if current.is_full() {
                break;
            }
            current = self
                .snapshots
                .get(base_id)
                .ok_or_else(|| SnapshotError::BrokenChain {
                    id: current.id.clone(),
                    base: base_id.to_string(),
                })?;
        }
        Ok(chain)
    }

    /// Resolve a snapshot to its full document, verifying the checksum.
    pub fn restore_from_snapshot(&self, id: &str) -> Result<RestoredSnapshot, SnapshotError> {
        let chain = self.chain(id)?;
        let mut data = Value::Null;
        for snapshot in chain.iter().rev() {
            data = match &snapshot.body {
                SnapshotBody::Full { data } => data.clone(),
                SnapshotBody::Delta { delta } => delta.apply(&data),
                SnapshotBody::CompressedDelta { blob } => {
                    let text = self
                        .compressor
                        .decompress_str(&CompressedData {
                            data: blob.clone(),
                            compressed: true,
                            original_size: 0,
                        })
                        .map_err(|e| SnapshotError::Compression(e.to_string()))?;
                    let delta: SnapshotDelta = serde_json::from_str(&text)?;
                    delta.apply(&data)
                }
            };
        }

        let target = chain[0];
        let actual = Checksum::of(&data)?;
        if actual != target.checksum {
            return Err(SnapshotError::InvalidChecksum {
                id: target.id.clone(),
                expected: target.checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(RestoredSnapshot {
            snapshot_id: target.id.clone(),
            version: target.version.clone(),
            data,
        })
    }

    /// Keep the `keep` most recent snapshots plus every base they depend on.
    /// Returns the number removed.
    pub fn prune_snapshots(&mut self, keep: usize) -> usize {
        let mut by_age: Vec<&StateSnapshot> = self.snapshots.values().collect();
        by_age.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let mut retained: HashSet<String> = HashSet::new();
        for snapshot in by_age.into_iter().take(keep) {
            let mut current = Some(snapshot);
            while let Some(s) = current {
                if !retained.insert(s.id.clone()) {
                    break;
                }
                current = s
                    .base_snapshot_id
                    .as_deref()
                    .and_then(|base| self.snapshots.get(base));
            }
        }

        let before = self.snapshots.len();
        self.snapshots.retain(|id, _| retained.contains(id));
        if let Some(latest) = &self.latest {
            if !self.snapshots.contains_key(latest) {
                self.latest = None;
            }
        }
        let removed = before - self.snapshots.len();
        if removed > 0 {
            tracing::debug!(removed, kept = self.snapshots.len(), "pruned snapshots");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<&StateSnapshot> {
        self.snapshots.get(id)
    }

    pub fn latest(&self) -> Option<&StateSnapshot> {
        self.latest.as_deref().and_then(|id| self.snapshots.get(id))
    }

    pub fn latest_id(&self) -> Option<&str> {
        self.latest.as_deref()
    }

    /// The newest snapshot whose version is before or equal to `version`.
    pub fn find_covering(&self, version: &VectorClock) -> Option<&StateSnapshot> {
        self.snapshots
            .values()
            .filter(|s| s.version.is_before_or_equal(version))
            .max_by_key(|s| s.sequence)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn stats(&self) -> SnapshotStats {
        let mut stats = SnapshotStats {
            count: self.snapshots.len(),
            ..Default::default()
        };
        for snapshot in self.snapshots.values() {
            if snapshot.is_full() {
                stats.full += 1;
            } else {
                stats.incremental += 1;
            }
            if snapshot.compressed {
                stats.compressed += 1;
            }
            stats.total_size += snapshot.size();
        }
        stats
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new()
    }
}

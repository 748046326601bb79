//! The state manager: versioned history, branch heads, remote merges and
//! automatic snapshots for one writer.

use crate::controller::{ConflictResolverFn, MergeResult, MergeStrategy, VersionController};
use crate::error::{Result, StateError};
use crate::snapshot::{SnapshotConfig, SnapshotManager};
use crate::state::VersionedState;
use causeway_core::{ClockOrdering, VectorClock};
use causeway_delta::{DeltaSyncEngine, PatchMessage, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Name of the branch every manager starts on.
pub const MAIN_BRANCH: &str = "main";

/// Configuration for the state manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// This process's writer id; only its own clock entry is ever incremented.
    pub writer_id: String,
    /// States kept before old ones are pruned, 0 keeps everything.
    pub max_history: usize,
    /// Take snapshots from `update_state` every `snapshot.interval` updates.
    pub auto_snapshot: bool,
    pub merge_strategy: MergeStrategy,
    /// Fail rebases that leave conflicts unresolved.
    pub strict_rebase: bool,
    pub snapshot: SnapshotConfig,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            writer_id: "local".to_string(),
            max_history: 1000,
            auto_snapshot: true,
            merge_strategy: MergeStrategy::default(),
            strict_rebase: false,
            snapshot: SnapshotConfig::default(),
        }
    }
}

/// Builder for state manager configuration.
pub struct StateConfigBuilder {
    config: StateConfig,
}

impl StateConfigBuilder {
    pub fn new(writer_id: impl Into<String>) -> Self {
        Self {
            config: StateConfig {
                writer_id: writer_id.into(),
                ..Default::default()
            },
        }
    }

    pub fn max_history(mut self, states: usize) -> Self {
        self.config.max_history = states;
        self
    }

    pub fn auto_snapshot(mut self, enabled: bool) -> Self {
        self.config.auto_snapshot = enabled;
        self
    }

    pub fn snapshot_interval(mut self, updates: u64) -> Self {
        self.config.snapshot.interval = updates;
        self
    }

    pub fn merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.config.merge_strategy = strategy;
        self
    }

    pub fn strict_rebase(mut self, strict: bool) -> Self {
        self.config.strict_rebase = strict;
        self
    }

    pub fn build(self) -> StateConfig {
        self.config
    }
}

/// What `merge_remote_state` did with a remote record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteMerge {
    /// Already in history; nothing changed.
    Duplicate,
    /// Stored and made the head of the active branch.
    Advanced,
    /// Stored, head unchanged (remote is older or concurrent).
    Stored,
}

pub struct StateManager {
    config: StateConfig,
    history: HashMap<String, VersionedState>,
    /// Insertion order of `history`.
    order: Vec<String>,
    branches: BTreeMap<String, Option<String>>,
    active: String,
    controller: VersionController,
    snapshots: SnapshotManager,
}

impl StateManager {
    pub fn new(writer_id: impl Into<String>) -> Self {
        Self::with_config(StateConfigBuilder::new(writer_id).build())
    }

    pub fn with_config(config: StateConfig) -> Self {
        let controller =
            VersionController::with_strategy(config.merge_strategy).strict(config.strict_rebase);
        let snapshots = SnapshotManager::with_config(config.snapshot.clone());
        let mut branches = BTreeMap::new();
        branches.insert(MAIN_BRANCH.to_string(), None);
        Self {
            config,
            history: HashMap::new(),
            order: Vec::new(),
            branches,
            active: MAIN_BRANCH.to_string(),
            controller,
            snapshots,
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn writer_id(&self) -> &str {
        &self.config.writer_id
    }

    /// Create a root state and make it the head of the active branch.
    pub fn create_state(&mut self, data: Value) -> Result<VersionedState> {
        let state = VersionedState::root(&self.config.writer_id, data)?;
        self.store(state.clone());
        self.set_head(&state.id);
        tracing::debug!(state_id = %state.id, writer = %self.config.writer_id, "created state");
        Ok(state)
    }

    /// Derive a new state from `state_id` by running `mutator` on a copy of
    /// its data. The mutator may edit in place or assign a new document.
    pub fn update_state<F>(&mut self, state_id: &str, mutator: F) -> Result<VersionedState>
    where
        F: FnOnce(&mut Value),
    {
        let parent = self
            .history
            .get(state_id)
            .ok_or_else(|| StateError::NotFound(state_id.to_string()))?;
        let mut data = parent.data.clone();
        mutator(&mut data);
        let state = parent.child(&self.config.writer_id, data)?;

        self.store(state.clone());
        self.set_head(&state.id);
        self.maybe_snapshot(&state);
        self.enforce_history_limit();
        Ok(state)
    }

    /// Store a state received from another writer.
    ///
    /// A checksum mismatch is fatal and nothing is stored. The head advances
    /// only if the remote is causally newer than it, or if nothing in history
    /// is causally related to the remote.
    pub fn merge_remote_state(&mut self, remote: VersionedState) -> Result<RemoteMerge> {
        if let Err(err) = remote.verify() {
            tracing::warn!(state_id = %remote.id, "discarding remote state with bad checksum");
            return Err(err);
        }
        if self.history.contains_key(&remote.id) {
            return Ok(RemoteMerge::Duplicate);
        }

        let advance = match self.head() {
            None => true,
            Some(head) => {
                remote.version.compare(&head.version) == ClockOrdering::After
                    || !self.history.values().any(|s| {
                        s.version.is_before_or_equal(&remote.version)
                            || remote.version.is_before_or_equal(&s.version)
                    })
            }
        };

        let id = remote.id.clone();
        self.store(remote);
        if advance {
            self.set_head(&id);
            Ok(RemoteMerge::Advanced)
        } else {
            Ok(RemoteMerge::Stored)
        }
    }

    /// Store a remote state and fold it into the head: newer states advance
    /// the head, concurrent ones are merged against their common ancestor.
    pub fn reconcile_remote_state(&mut self, remote: VersionedState) -> Result<MergeResult> {
        let remote_id = remote.id.clone();
        self.merge_remote_state(remote)?;
        let head_id = self
            .head_id()
            .map(str::to_string)
            .ok_or_else(|| StateError::NotFound(remote_id.clone()))?;
        if head_id == remote_id {
            return Ok(MergeResult {
                state: self.lookup(&head_id)?.clone(),
                conflicts: Vec::new(),
                resolved: true,
            });
        }
        self.merge_states(&head_id, &remote_id)
    }

    /// Apply a patch message from another writer on top of `state_id` and
    /// store the result at the message's target version.
    ///
    /// The message must be based on exactly the stored version. A bad
    /// checksum, a version mismatch or a failing patch stores nothing. A
    /// message whose target version is already stored is a no-op.
    pub fn apply_patch_message(
        &mut self,
        state_id: &str,
        engine: &DeltaSyncEngine,
        message: &PatchMessage,
    ) -> Result<VersionedState> {
        if let Some(existing) = self
            .states()
            .find(|s| s.version.is_equal(&message.target_version))
        {
            return Ok(existing.clone());
        }
        let base = self.lookup(state_id)?;
        let applied = engine.apply_patch_message(&base.data, &base.version, message)?;
        if let Some(error) = applied.first_error() {
            return Err(SyncError::Patch(error.clone()).into());
        }
        let state = VersionedState::new(
            message.target_version.clone(),
            applied.state,
            Some(base.version.clone()),
        )?;

        let advance = self
            .head()
            .map_or(true, |head| state.version.compare(&head.version) == ClockOrdering::After);
        self.store(state.clone());
        if advance {
            self.set_head(&state.id);
        }
        tracing::debug!(
            state_id = %state.id,
            message_id = %message.id,
            version = %state.version,
            "applied patch message"
        );
        self.maybe_snapshot(&state);
        self.enforce_history_limit();
        Ok(state)
    }

    /// The exact version if stored, else its closest stored causal ancestor.
    pub fn get_state_at_version(&self, version: &VectorClock) -> Option<&VersionedState> {
        let states = || self.order.iter().filter_map(|id| self.history.get(id));
        states()
            .filter(|s| s.version.is_equal(version))
            .last()
            .or_else(|| {
                states()
                    .filter(|s| s.version.is_before(version))
                    .max_by_key(|s| s.version.sum())
            })
    }

    /// The newest stored state causally at or before both versions.
    pub fn common_ancestor(&self, a: &VectorClock, b: &VectorClock) -> Option<&VersionedState> {
        self.order
            .iter()
            .filter_map(|id| self.history.get(id))
            .filter(|s| s.version.is_before_or_equal(a) && s.version.is_before_or_equal(b))
            .max_by_key(|s| s.version.sum())
    }

    /// Merge two stored states with the configured strategy; the result
    /// becomes the head of the active branch.
    pub fn merge_states(&mut self, local_id: &str, remote_id: &str) -> Result<MergeResult> {
        let strategy = self.config.merge_strategy;
        self.merge_states_with(local_id, remote_id, strategy, None)
    }

    pub fn merge_states_with(
        &mut self,
        local_id: &str,
        remote_id: &str,
        strategy: MergeStrategy,
        resolver: Option<&ConflictResolverFn>,
    ) -> Result<MergeResult> {
        let local = self.lookup(local_id)?;
        let remote = self.lookup(remote_id)?;
        let ancestor = self.common_ancestor(&local.version, &remote.version);
        let result = self
            .controller
            .merge_with(local, remote, ancestor, strategy, resolver)?;
        self.adopt(&result.state);
        Ok(result)
    }

    /// Replay `source_id`'s changes on top of `target_id`.
    pub fn rebase(&mut self, source_id: &str, target_id: &str) -> Result<MergeResult> {
        let source = self.lookup(source_id)?;
        let target = self.lookup(target_id)?;
        let ancestor = self.common_ancestor(&source.version, &target.version);
        let result = self.controller.rebase(source, target, ancestor)?;
        self.adopt(&result.state);
        Ok(result)
    }

    pub fn create_branch(&mut self, name: &str, from_state_id: Option<&str>) -> Result<()> {
        if self.branches.contains_key(name) {
            return Err(StateError::BranchExists(name.to_string()));
        }
        let head = match from_state_id {
            Some(id) => Some(self.lookup(id)?.id.clone()),
            None => self.head_id().map(str::to_string),
        };
        self.branches.insert(name.to_string(), head);
        Ok(())
    }

    /// Switch the active branch; returns its head.
    pub fn checkout_branch(&mut self, name: &str) -> Result<Option<&VersionedState>> {
        if !self.branches.contains_key(name) {
            return Err(StateError::BranchNotFound(name.to_string()));
        }
        self.active = name.to_string();
        Ok(self.head())
    }

    pub fn delete_branch(&mut self, name: &str) -> Result<()> {
        if name == self.active {
            return Err(StateError::ActiveBranch(name.to_string()));
        }
        self.branches
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StateError::BranchNotFound(name.to_string()))
    }

    pub fn active_branch(&self) -> &str {
        &self.active
    }

    pub fn branches(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.branches
            .iter()
            .map(|(name, head)| (name.as_str(), head.as_deref()))
    }

    pub fn branch_head(&self, name: &str) -> Option<&VersionedState> {
        self.branches
            .get(name)
            .and_then(|head| head.as_deref())
            .and_then(|id| self.history.get(id))
    }

    pub fn head_id(&self) -> Option<&str> {
        self.branches.get(&self.active).and_then(|head| head.as_deref())
    }

    /// Head of the active branch.
    pub fn head(&self) -> Option<&VersionedState> {
        self.head_id().and_then(|id| self.history.get(id))
    }

    pub fn get_state(&self, id: &str) -> Option<&VersionedState> {
        self.history.get(id)
    }

    /// Every stored state, oldest first.
    pub fn states(&self) -> impl Iterator<Item = &VersionedState> {
        self.order.iter().filter_map(|id| self.history.get(id))
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Keep the `keep` newest states plus every branch head. Returns the
    /// number of states removed.
    pub fn prune_history(&mut self, keep: usize) -> usize {
        let mut retained: HashSet<String> = self.order.iter().rev().take(keep).cloned().collect();
        retained.extend(self.branches.values().flatten().cloned());

        let before = self.order.len();
        self.order.retain(|id| retained.contains(id));
        self.history.retain(|id, _| retained.contains(id));
        let removed = before - self.order.len();
        if removed > 0 {
            tracing::debug!(removed, kept = self.order.len(), "pruned state history");
        }
        removed
    }

    /// Snapshot a stored state, incrementally against the latest snapshot
    /// when enabled.
    pub fn create_snapshot(&mut self, state_id: &str) -> Result<String> {
        let state = self
            .history
            .get(state_id)
            .ok_or_else(|| StateError::NotFound(state_id.to_string()))?;
        let base = self.snapshots.latest_id().map(str::to_string);
        Ok(self.snapshots.create_snapshot(state, base.as_deref())?)
    }

    /// Bring a snapshot back into history and make it the head.
    pub fn restore_from_snapshot(&mut self, snapshot_id: &str) -> Result<VersionedState> {
        let restored = self.snapshots.restore_from_snapshot(snapshot_id)?;
        let existing = self
            .states()
            .find(|s| s.version.is_equal(&restored.version) && s.data == restored.data)
            .cloned();
        let state = match existing {
            Some(state) => state,
            None => {
                let state = VersionedState::new(restored.version, restored.data, None)?;
                self.store(state.clone());
                state
            }
        };
        self.set_head(&state.id);
        Ok(state)
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn snapshots_mut(&mut self) -> &mut SnapshotManager {
        &mut self.snapshots
    }

    pub fn controller(&self) -> &VersionController {
        &self.controller
    }

    fn lookup(&self, id: &str) -> Result<&VersionedState> {
        self.history
            .get(id)
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    fn store(&mut self, state: VersionedState) {
        if !self.history.contains_key(&state.id) {
            self.order.push(state.id.clone());
        }
        self.history.insert(state.id.clone(), state);
    }

    fn set_head(&mut self, id: &str) {
        self.branches.insert(self.active.clone(), Some(id.to_string()));
    }

    fn adopt(&mut self, state: &VersionedState) {
        if !self.history.contains_key(&state.id) {
            self.store(state.clone());
        }
        self.set_head(&state.id);
    }

    fn maybe_snapshot(&mut self, state: &VersionedState) {
        if !self.config.auto_snapshot || !self.snapshots.should_create_snapshot() {
            return;
        }
        let base = self.snapshots.latest_id().map(str::to_string);
        if let Err(err) = self.snapshots.create_snapshot(state, base.as_deref()) {
            tracing::warn!(state_id = %state.id, error = %err, "automatic snapshot failed");
        }
    }

    fn enforce_history_limit(&mut self) {
        if self.config.max_history > 0 && self.order.len() > self.config.max_history {
            self.prune_history(self.config.max_history);
        }
    }
}

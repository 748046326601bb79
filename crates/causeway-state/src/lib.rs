//! # causeway-state
//!
//! Causally versioned state for one writer among many.
//!
//! Every change produces a new immutable [`VersionedState`] whose vector
//! clock advances only the local writer's entry. States from other writers
//! are verified and stored as they arrive; concurrent versions are merged by
//! the [`VersionController`] against their latest common ancestor.
//!
//! - [`StateManager`]: history, branch heads, remote merges, pruning
//! - [`VersionController`]: three-way merge, conflict strategies, rebase
//! - [`SnapshotManager`]: full and incremental snapshots with restore chains
//! - [`SchemaMigrator`]: ordered document upgrades
//!
//! # Example
//!
//! ```rust
//! use causeway_state::StateManager;
//! use serde_json::json;
//!
//! let mut c1 = StateManager::new("c1");
//! let base = c1.create_state(json!({"a": 1, "b": 2})).unwrap();
//!
//! let mut c2 = StateManager::new("c2");
//! c2.merge_remote_state(base.clone()).unwrap();
//!
//! c1.update_state(&base.id, |doc| doc["a"] = json!(10)).unwrap();
//! let theirs = c2.update_state(&base.id, |doc| doc["b"] = json!(20)).unwrap();
//!
//! let merged = c1.reconcile_remote_state(theirs).unwrap();
//! assert_eq!(merged.state.data, json!({"a": 10, "b": 20}));
//! assert!(merged.conflicts.is_empty());
//! ```

pub mod controller;
pub mod error;
pub mod manager;
pub mod migration;
pub mod snapshot;
pub mod state;

pub use controller::{
    set_at_path, Conflict, ConflictResolverFn, MergeResult, MergeStrategy, VersionController,
    RESERVED_KEYS,
};
pub use error::{Result, SnapshotError, StateError};
pub use manager::{RemoteMerge, StateConfig, StateConfigBuilder, StateManager, MAIN_BRANCH};
pub use migration::{MigrationFn, SchemaMigrator};
pub use snapshot::{
    FieldChange, RestoredSnapshot, SnapshotBody, SnapshotConfig, SnapshotDelta, SnapshotManager,
    SnapshotStats, StateSnapshot,
};
pub use state::VersionedState;

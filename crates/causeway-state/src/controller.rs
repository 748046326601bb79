//! Reconciliation of concurrent versions.
//!
//! Ordered versions short-circuit through the vector clocks; only truly
//! concurrent versions are merged. The merge is three-way when a common
//! ancestor is known: a side that left a value untouched defers to the side
//! that changed it, and only values changed differently on both sides are
//! conflicts. Without an ancestor the merge is a union and every leaf that
//! differs is a conflict.

use crate::error::{Result, StateError};
use crate::state::VersionedState;
use causeway_core::value::deep_equal;
use causeway_core::ClockOrdering;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Keys a resolution may never be written through.
pub const RESERVED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Default resolution for conflicting leaves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    /// Keep the local value.
    #[default]
    KeepLocal,
    /// Take the remote value.
    LastWriteWins,
    /// Keep the local value but report the merge as unresolved.
    Manual,
}

/// A leaf changed differently on both sides. `None` means absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Dotted path, `""` for the root.
    pub path: String,
    pub segments: Vec<String>,
    pub local_value: Option<Value>,
    pub remote_value: Option<Value>,
    pub base_value: Option<Value>,
}

/// Caller-supplied resolution; `None` removes the field.
pub type ConflictResolverFn = dyn Fn(&Conflict) -> Option<Value>;

#[derive(Clone, Debug)]
pub struct MergeResult {
    pub state: VersionedState,
    pub conflicts: Vec<Conflict>,
    /// False when conflicts were left for manual resolution.
    pub resolved: bool,
}

#[derive(Clone, Copy)]
enum Ancestor<'a> {
    /// No common ancestor is known.
    Unknown,
    /// The ancestor exists but has nothing here.
    Absent,
    Present(&'a Value),
}

impl<'a> Ancestor<'a> {
    fn child(self, key: &str) -> Ancestor<'a> {
        match self {
            Ancestor::Unknown => Ancestor::Unknown,
            Ancestor::Present(Value::Object(map)) => map.get(key).map_or(Ancestor::Absent, Ancestor::Present),
            _ => Ancestor::Absent,
        }
    }

    fn known(self) -> Option<Option<&'a Value>> {
        match self {
            Ancestor::Unknown => None,
            Ancestor::Absent => Some(None),
            Ancestor::Present(value) => Some(Some(value)),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct VersionController {
    strategy: MergeStrategy,
    strict: bool,
}

impl VersionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(strategy: MergeStrategy) -> Self {
        VersionController {
            strategy,
            strict: false,
        }
    }

    /// In strict mode `rebase` fails instead of leaving conflicts open.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Merge with the controller's default strategy.
    pub fn merge(
        &self,
        local: &VersionedState,
        remote: &VersionedState,
        ancestor: Option<&VersionedState>,
    ) -> Result<MergeResult> {
        self.merge_with(local, remote, ancestor, self.strategy, None)
    }

    pub fn merge_with(
        &self,
        local: &VersionedState,
        remote: &VersionedState,
        ancestor: Option<&VersionedState>,
        strategy: MergeStrategy,
        resolver: Option<&ConflictResolverFn>,
    ) -> Result<MergeResult> {
        let clean = |state: &VersionedState| MergeResult {
            state: state.clone(),
            conflicts: Vec::new(),
            resolved: true,
        };
        match local.version.compare(&remote.version) {
            ClockOrdering::Equal | ClockOrdering::After => return Ok(clean(local)),
            ClockOrdering::Before => return Ok(clean(remote)),
            ClockOrdering::Concurrent => {}
        }

        let base = ancestor.map_or(Ancestor::Unknown, |a| Ancestor::Present(&a.data));
        let mut conflicts = Vec::new();
        let mut segments = Vec::new();
        let merged = merge_node(
            base,
            Some(&local.data),
            Some(&remote.data),
            &mut segments,
            &mut conflicts,
        );
        let mut data = merged.unwrap_or(Value::Null);

        let mut resolved = true;
        for conflict in &conflicts {
            let value = match resolver {
                Some(resolve) => resolve(conflict),
                None => match strategy {
                    MergeStrategy::KeepLocal => conflict.local_value.clone(),
                    MergeStrategy::LastWriteWins => conflict.remote_value.clone(),
                    MergeStrategy::Manual => {
                        resolved = false;
                        conflict.local_value.clone()
                    }
                },
            };
            set_at_path(&mut data, &conflict.segments, value)?;
        }

        if !conflicts.is_empty() {
            tracing::debug!(
                local = %local.version,
                remote = %remote.version,
                conflicts = conflicts.len(),
                ?strategy,
                "merged concurrent versions"
            );
        }

        let state = VersionedState::new(
            local.version.merge(&remote.version),
            data,
            Some(local.version.clone()),
        )?;
        Ok(MergeResult {
            state,
            conflicts,
            resolved,
        })
    }

    /// Replay `source`'s changes on top of `target`.
    pub fn rebase(
        &self,
        source: &VersionedState,
        target: &VersionedState,
        ancestor: Option<&VersionedState>,
    ) -> Result<MergeResult> {
        let result = self.merge(target, source, ancestor)?;
        if self.strict && !result.resolved {
            return Err(StateError::UnresolvedConflicts(result.conflicts.len()));
        }
        Ok(result)
    }
}

fn same(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => deep_equal(x, y),
        _ => false,
    }
}

fn merge_node(
    base: Ancestor<'_>,
    local: Option<&Value>,
    remote: Option<&Value>,
    segments: &mut Vec<String>,
    conflicts: &mut Vec<Conflict>,
) -> Option<Value> {
    if same(local, remote) {
        return local.cloned();
    }
    if let Some(base_value) = base.known() {
        if same(base_value, local) {
            return remote.cloned();
        }
        if same(base_value, remote) {
            return local.cloned();
        }
    }

    match (local, remote) {
        (Some(Value::Object(l)), Some(Value::Object(r))) => {
            let keys: BTreeSet<&String> = l.keys().chain(r.keys()).collect();
            let mut out = Map::new();
            for key in keys {
                segments.push(key.clone());
                let merged = merge_node(base.child(key), l.get(key), r.get(key), segments, conflicts);
                segments.pop();
                if let Some(value) = merged {
                    out.insert(key.clone(), value);
                }
            }
            Some(Value::Object(out))
        }
        (Some(only), None) | (None, Some(only)) if matches!(base, Ancestor::Unknown) => Some(only.clone()),
        _ => {
            conflicts.push(Conflict {
                path: segments.join("."),
                segments: segments.clone(),
                local_value: local.cloned(),
                remote_value: remote.cloned(),
                base_value: base.known().flatten().cloned(),
            });
            local.cloned()
        }
    }
}

/// Write (or with `None`, delete) the value at `segments`, creating
/// intermediate objects. Reserved keys are rejected before anything is
/// written.
pub fn set_at_path(doc: &mut Value, segments: &[String], value: Option<Value>) -> Result<()> {
    if let Some(key) = segments.iter().find(|s| RESERVED_KEYS.contains(&s.as_str())) {
        return Err(StateError::ReservedKey {
            path: segments.join("."),
            key: key.clone(),
        });
    }
    let Some((last, parents)) = segments.split_last() else {
        *doc = value.unwrap_or(Value::Null);
        return Ok(());
    };

    let mut current = doc;
    for segment in parents {
        if !current.is_object() {
            // indexing a null turns it into an object
            *current = Value::Null;
        }
        current = &mut current[segment.as_str()];
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        match value {
            Some(value) => {
                map.insert(last.clone(), value);
            }
            None => {
                map.remove(last);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::VectorClock;
    use serde_json::json;

    fn state(clock: &[(&str, u64)], data: Value) -> VersionedState {
        let version = VectorClock::from_entries(clock.iter().map(|(w, c)| (w.to_string(), *c)));
        VersionedState::new(version, data, None).unwrap()
    }

    #[test]
    fn test_ordered_versions_short_circuit() {
        let controller = VersionController::new();
        let old = state(&[("c1", 1)], json!({"v": 1}));
        let new = state(&[("c1", 2)], json!({"v": 2}));

        let result = controller.merge(&old, &new, None).unwrap();
        assert_eq!(result.state.id, new.id);
        let result = controller.merge(&new, &old, None).unwrap();
        assert_eq!(result.state.id, new.id);
        let result = controller.merge(&new, &new.clone(), None).unwrap();
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_disjoint_edits_with_ancestor() {
        let controller = VersionController::new();
        let base = state(&[], json!({"a": 1, "b": 2}));
        let local = state(&[("c1", 1)], json!({"a": 10, "b": 2}));
        let remote = state(&[("c2", 1)], json!({"a": 1, "b": 20}));

        let result = controller.merge(&local, &remote, Some(&base)).unwrap();
        assert_eq!(result.state.data, json!({"a": 10, "b": 20}));
        assert!(result.conflicts.is_empty());
        assert!(result.resolved);
        assert_eq!(result.state.version.to_string(), "c1:1,c2:1");
    }

    #[test]
    fn test_same_field_conflict_strategies() {
        let base = state(&[], json!({"value": 1}));
        let local = state(&[("c1", 1)], json!({"value": 2}));
        let remote = state(&[("c2", 1)], json!({"value": 3}));

        let lww = VersionController::with_strategy(MergeStrategy::LastWriteWins);
        let result = lww.merge(&local, &remote, Some(&base)).unwrap();
        assert_eq!(result.state.data, json!({"value": 3}));
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].path, "value");
        assert_eq!(result.conflicts[0].base_value, Some(json!(1)));

        let keep = VersionController::new();
        let result = keep.merge(&local, &remote, Some(&base)).unwrap();
        assert_eq!(result.state.data, json!({"value": 2}));

        let manual = VersionController::with_strategy(MergeStrategy::Manual);
        let result = manual.merge(&local, &remote, Some(&base)).unwrap();
        assert!(!result.resolved);
    }

    #[test]
    fn test_union_without_ancestor() {
        let controller = VersionController::new();
        let local = state(&[("c1", 1)], json!({"shared": 1, "mine": true, "n": {"x": 1}}));
        let remote = state(&[("c2", 1)], json!({"shared": 2, "theirs": true, "n": {"y": 2}}));

        let result = controller.merge(&local, &remote, None).unwrap();
        assert_eq!(
            result.state.data,
            json!({"shared": 1, "mine": true, "theirs": true, "n": {"x": 1, "y": 2}})
        );
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].path, "shared");
    }

    #[test]
    fn test_nested_paths_are_dotted() {
        let controller = VersionController::with_strategy(MergeStrategy::LastWriteWins);
        let base = state(&[], json!({"user": {"profile": {"name": "a"}}}));
        let local = state(&[("c1", 1)], json!({"user": {"profile": {"name": "b"}}}));
        let remote = state(&[("c2", 1)], json!({"user": {"profile": {"name": "c"}}}));

        let result = controller.merge(&local, &remote, Some(&base)).unwrap();
        assert_eq!(result.conflicts[0].path, "user.profile.name");
        assert_eq!(result.state.data["user"]["profile"]["name"], "c");
    }

    #[test]
    fn test_delete_versus_edit_conflicts() {
        let controller = VersionController::new();
        let base = state(&[], json!({"a": 1, "b": 1}));
        let local = state(&[("c1", 1)], json!({"b": 1}));
        let remote = state(&[("c2", 1)], json!({"a": 5, "b": 1}));

        let result = controller.merge(&local, &remote, Some(&base)).unwrap();
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].local_value, None);
        assert_eq!(result.state.data, json!({"b": 1}));
    }

    #[test]
    fn test_custom_resolver() {
        let controller = VersionController::new();
        let base = state(&[], json!({"count": 1}));
        let local = state(&[("c1", 1)], json!({"count": 4}));
        let remote = state(&[("c2", 1)], json!({"count": 7}));

        let sum = |c: &Conflict| {
            let l = c.local_value.as_ref().and_then(Value::as_i64).unwrap_or(0);
            let r = c.remote_value.as_ref().and_then(Value::as_i64).unwrap_or(0);
            Some(json!(l + r))
        };
        let result = controller
            .merge_with(&local, &remote, Some(&base), MergeStrategy::KeepLocal, Some(&sum))
            .unwrap();
        assert_eq!(result.state.data, json!({"count": 11}));
        assert!(result.resolved);
    }

    #[test]
    fn test_reserved_keys_rejected() {
        let controller = VersionController::new();
        let local = state(&[("c1", 1)], json!({"__proto__": {"admin": false}}));
        let remote = state(&[("c2", 1)], json!({"__proto__": {"admin": true}}));

        let err = controller.merge(&local, &remote, None).unwrap_err();
        assert!(matches!(err, StateError::ReservedKey { ref key, .. } if key == "__proto__"));

        let mut doc = json!({});
        let segments = vec!["a".to_string(), "constructor".to_string()];
        assert!(set_at_path(&mut doc, &segments, Some(json!(1))).is_err());
        assert_eq!(doc, json!({}));
    }

    #[test]
    fn test_set_at_path_creates_and_removes() {
        let mut doc = json!({"a": 1});
        let path = vec!["x".to_string(), "y".to_string()];
        set_at_path(&mut doc, &path, Some(json!(2))).unwrap();
        assert_eq!(doc, json!({"a": 1, "x": {"y": 2}}));
        set_at_path(&mut doc, &path, None).unwrap();
        assert_eq!(doc, json!({"a": 1, "x": {}}));
    }

    #[test]
    fn test_strict_rebase() {
        let base = state(&[], json!({"v": 0}));
        let source = state(&[("c1", 1)], json!({"v": 1}));
        let target = state(&[("c2", 1)], json!({"v": 2}));

        let lenient = VersionController::with_strategy(MergeStrategy::Manual);
        assert!(lenient.rebase(&source, &target, Some(&base)).is_ok());

        let strict = VersionController::with_strategy(MergeStrategy::Manual).strict(true);
        let err = strict.rebase(&source, &target, Some(&base)).unwrap_err();
        assert!(matches!(err, StateError::UnresolvedConflicts(1)));

        let rebased = VersionController::new()
            .strict(true)
            .rebase(&source, &target, Some(&base))
            .unwrap();
        // target is local in a rebase
        assert_eq!(rebased.state.data, json!({"v": 2}));
    }
}

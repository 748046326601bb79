//! Conflict detection and resolution between concurrent patch sets.
//!
//! Two patch lists generated independently against the same base conflict
//! wherever they touch the same location, or one touches a parent of what
//! the other touches. Patches outside any conflict are always kept.

use crate::patch::{JsonPatch, PatchOp};
use causeway_core::pointer;
use causeway_core::value::deep_equal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a conflicting incoming patch is treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchConflictStrategy {
    /// Drop the incoming patch.
    Skip,
    /// Last write wins: the incoming patch replaces the local one.
    Retry,
    /// Reconcile same-op/same-path pairs; anything else stays local.
    #[default]
    Merge,
}

/// One colliding pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchConflict {
    pub path: String,
    pub local_index: usize,
    pub incoming_index: usize,
    pub local: JsonPatch,
    pub incoming: JsonPatch,
}

impl PatchConflict {
    /// Same operation on the same path.
    pub fn is_same_target(&self) -> bool {
        self.local.op == self.incoming.op && self.local.path == self.incoming.path
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    KeepLocal,
    TakeIncoming,
    /// Local patch kept, incoming dropped, conflict reported.
    Unresolved,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub conflict: PatchConflict,
    pub resolution: Resolution,
}

/// Result of merging two patch sets.
#[derive(Clone, Debug, Default)]
pub struct PatchMergeOutcome {
    pub patches: Vec<JsonPatch>,
    pub conflicts: Vec<ResolvedConflict>,
}

impl PatchMergeOutcome {
    pub fn unresolved(&self) -> impl Iterator<Item = &PatchConflict> {
        self.conflicts
            .iter()
            .filter(|c| c.resolution == Resolution::Unresolved)
            .map(|c| &c.conflict)
    }

    pub fn is_clean(&self) -> bool {
        self.unresolved().next().is_none()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConflictResolver {
    strategy: PatchConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: PatchConflictStrategy) -> Self {
        ConflictResolver { strategy }
    }

    pub fn strategy(&self) -> PatchConflictStrategy {
        self.strategy
    }

    /// Every pair `(local[i], incoming[j])` whose touched locations overlap.
    pub fn detect_conflicts(&self, local: &[JsonPatch], incoming: &[JsonPatch]) -> Vec<PatchConflict> {
        let mut conflicts = Vec::new();
        for (i, a) in local.iter().enumerate() {
            for (j, b) in incoming.iter().enumerate() {
                if let Some(path) = collision(a, b) {
                    conflicts.push(PatchConflict {
                        path,
                        local_index: i,
                        incoming_index: j,
                        local: a.clone(),
                        incoming: b.clone(),
                    });
                }
            }
        }
        conflicts
    }

    pub fn resolve_conflicts(&self, conflicts: &[PatchConflict]) -> Vec<ResolvedConflict> {
        conflicts
            .iter()
            .map(|conflict| ResolvedConflict {
                conflict: conflict.clone(),
                resolution: self.decide(conflict),
            })
            .collect()
    }

    /// Merge two patch lists made against the same base.
    ///
    /// The output is the surviving local patches followed by the surviving
    /// incoming ones. An incoming patch survives only if every conflict it is
    /// part of resolves to [`Resolution::TakeIncoming`]; in that case the
    /// local patches it collided with are dropped.
    pub fn three_way_merge(&self, local: &[JsonPatch], incoming: &[JsonPatch]) -> PatchMergeOutcome {
        let conflicts = self.resolve_conflicts(&self.detect_conflicts(local, incoming));

        let mut by_incoming: HashMap<usize, Vec<&ResolvedConflict>> = HashMap::new();
        for resolved in &conflicts {
            by_incoming
                .entry(resolved.conflict.incoming_index)
                .or_default()
                .push(resolved);
        }

        let mut drop_local = vec![false; local.len()];
        let mut drop_incoming = vec![false; incoming.len()];
        for (index, group) in &by_incoming {
            let wins = group.iter().all(|c| c.resolution == Resolution::TakeIncoming);
            if wins {
                for c in group {
                    drop_local[c.conflict.local_index] = true;
                }
            } else {
                drop_incoming[*index] = true;
            }
        }

        let mut patches = Vec::with_capacity(local.len() + incoming.len());
        patches.extend(
            local
                .iter()
                .zip(&drop_local)
                .filter(|(_, dropped)| !**dropped)
                .map(|(p, _)| p.clone()),
        );
        patches.extend(
            incoming
                .iter()
                .zip(&drop_incoming)
                .filter(|(_, dropped)| !**dropped)
                .map(|(p, _)| p.clone()),
        );

        if !conflicts.is_empty() {
            tracing::debug!(
                conflicts = conflicts.len(),
                strategy = ?self.strategy,
                "merged conflicting patch sets"
            );
        }
        PatchMergeOutcome { patches, conflicts }
    }

    fn decide(&self, conflict: &PatchConflict) -> Resolution {
        match self.strategy {
            PatchConflictStrategy::Skip => Resolution::KeepLocal,
            PatchConflictStrategy::Retry => Resolution::TakeIncoming,
            PatchConflictStrategy::Merge => {
                if !conflict.is_same_target() {
                    return Resolution::Unresolved;
                }
                match conflict.local.op {
                    PatchOp::Add | PatchOp::Replace => Resolution::TakeIncoming,
                    PatchOp::Remove => Resolution::KeepLocal,
                    PatchOp::Test => match (&conflict.local.value, &conflict.incoming.value) {
                        (Some(a), Some(b)) if deep_equal(a, b) => Resolution::KeepLocal,
                        _ => Resolution::Unresolved,
                    },
                    PatchOp::Move | PatchOp::Copy => {
                        if conflict.local.from == conflict.incoming.from {
                            Resolution::KeepLocal
                        } else {
                            Resolution::Unresolved
                        }
                    }
                }
            }
        }
    }
}

/// Locations a patch reads or writes.
fn touched(patch: &JsonPatch) -> impl Iterator<Item = &str> {
    std::iter::once(patch.path.as_str()).chain(patch.from.as_deref())
}

fn collision(a: &JsonPatch, b: &JsonPatch) -> Option<String> {
    for left in touched(a) {
        for right in touched(b) {
            if pointer::overlaps(left, right) {
                let path = if left.len() <= right.len() { left } else { right };
                return Some(path.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detects_same_path_and_ancestor() {
        let resolver = ConflictResolver::default();
        let local = vec![
            JsonPatch::replace("/a", json!(1)),
            JsonPatch::replace("/user/name", json!("x")),
            JsonPatch::replace("/z", json!(0)),
        ];
        let incoming = vec![
            JsonPatch::replace("/a", json!(2)),
            JsonPatch::remove("/user"),
            JsonPatch::replace("/b", json!(0)),
        ];
        let conflicts = resolver.detect_conflicts(&local, &incoming);
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].path, "/a");
        assert_eq!(conflicts[1].path, "/user");
        assert_eq!((conflicts[1].local_index, conflicts[1].incoming_index), (1, 1));
    }

    #[test]
    fn test_sibling_prefix_is_not_a_conflict() {
        let resolver = ConflictResolver::default();
        let conflicts = resolver.detect_conflicts(
            &[JsonPatch::replace("/item", json!(1))],
            &[JsonPatch::replace("/items", json!(2))],
        );
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_move_source_collides() {
        let resolver = ConflictResolver::default();
        let conflicts = resolver.detect_conflicts(
            &[JsonPatch::move_from("/a", "/b")],
            &[JsonPatch::replace("/a/x", json!(1))],
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, "/a");
    }

    #[test]
    fn test_skip_keeps_local() {
        let resolver = ConflictResolver::new(PatchConflictStrategy::Skip);
        let outcome = resolver.three_way_merge(
            &[JsonPatch::replace("/a", json!(1))],
            &[JsonPatch::replace("/a", json!(2)), JsonPatch::add("/b", json!(3))],
        );
        assert_eq!(
            outcome.patches,
            vec![JsonPatch::replace("/a", json!(1)), JsonPatch::add("/b", json!(3))]
        );
        assert!(outcome.is_clean());
    }

    #[test]
    fn test_retry_takes_incoming() {
        let resolver = ConflictResolver::new(PatchConflictStrategy::Retry);
        let outcome = resolver.three_way_merge(
            &[JsonPatch::replace("/a/b", json!(1))],
            &[JsonPatch::replace("/a", json!({"b": 2}))],
        );
        assert_eq!(outcome.patches, vec![JsonPatch::replace("/a", json!({"b": 2}))]);
    }

    #[test]
    fn test_merge_same_target() {
        let resolver = ConflictResolver::new(PatchConflictStrategy::Merge);
        let outcome = resolver.three_way_merge(
            &[JsonPatch::replace("/a", json!(1)), JsonPatch::remove("/gone")],
            &[JsonPatch::replace("/a", json!(2)), JsonPatch::remove("/gone")],
        );
        assert_eq!(
            outcome.patches,
            vec![JsonPatch::remove("/gone"), JsonPatch::replace("/a", json!(2))]
        );
        assert!(outcome.is_clean());
        assert_eq!(outcome.conflicts.len(), 2);
    }

    #[test]
    fn test_merge_mismatched_ops_unresolved() {
        let resolver = ConflictResolver::new(PatchConflictStrategy::Merge);
        let outcome = resolver.three_way_merge(
            &[JsonPatch::replace("/a", json!(1))],
            &[JsonPatch::remove("/a")],
        );
        assert_eq!(outcome.patches, vec![JsonPatch::replace("/a", json!(1))]);
        assert_eq!(outcome.unresolved().count(), 1);
        assert!(!outcome.is_clean());
    }

    #[test]
    fn test_strategy_wire_names() {
        let json = serde_json::to_string(&PatchConflictStrategy::Retry).unwrap();
        assert_eq!(json, "\"retry\"");
    }
}

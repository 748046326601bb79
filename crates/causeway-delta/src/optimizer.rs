//! Patch list optimization.
//!
//! Rewrites a patch list into an equivalent, never longer one:
//! - `add` + `remove` of the same array slot cancel
//! - `add` + `replace` fold into a single `add` of the final value
//! - consecutive `replace`s of one path keep only the last value
//! - `replace` + `remove` become a single `remove`
//! - move chains `A→B`, `B→C` through an array slot `B` collapse into
//!   `A→C`; `A→A` is dropped
//! - repeated identical `test`s are dropped
//!
//! A patch may fold into an earlier one across patches on unrelated paths,
//! as long as none of them shifts array indices: `replace`, `test`, and
//! `add`/`remove` of object keys. Array insertions and removals, `move` and
//! `copy` only fold with their immediate predecessor.
//!
//! An `add` or `move` onto an object key may overwrite an existing member,
//! so neither cancels or chains through that key; the document would keep
//! the old value.
//! Numeric tokens are taken to address array slots, where `add` inserts.

use crate::patch::{JsonPatch, PatchOp};
use causeway_core::pointer;
use causeway_core::value::deep_equal;

enum Fold {
    /// Drop the earlier patch and continue with this one.
    Merge(JsonPatch),
    /// Drop both patches.
    Cancel,
    /// Keep the earlier patch, drop the incoming one.
    DropIncoming,
}

/// Stateless patch list optimizer.
#[derive(Clone, Debug, Default)]
pub struct PatchOptimizer;

impl PatchOptimizer {
    pub fn new() -> Self {
        PatchOptimizer
    }

    pub fn optimize(&self, patches: &[JsonPatch]) -> Vec<JsonPatch> {
        let mut out: Vec<JsonPatch> = Vec::with_capacity(patches.len());

        for patch in patches {
            let mut incoming = Some(patch.clone());
            while let Some(next) = incoming.take() {
                if is_noop_move(&next) {
                    break;
                }
                let Some(index) = find_candidate(&out, &next) else {
                    out.push(next);
                    break;
                };
                let adjacent = index + 1 == out.len();
                match fold(&out[index], &next, adjacent) {
                    Some(Fold::Merge(merged)) => {
                        out.remove(index);
                        incoming = Some(merged);
                    }
                    Some(Fold::Cancel) => {
                        out.remove(index);
                    }
                    Some(Fold::DropIncoming) => {}
                    None => out.push(next),
                }
            }
        }

        if out.len() < patches.len() {
            tracing::trace!(before = patches.len(), after = out.len(), "optimized patch list");
        }
        out
    }
}

fn is_noop_move(patch: &JsonPatch) -> bool {
    patch.op == PatchOp::Move && patch.from.as_deref() == Some(patch.path.as_str())
}

fn is_append(path: &str) -> bool {
    path == "-" || path.ends_with("/-")
}

/// Whether the last token addresses an array slot (or could).
fn is_array_slot(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or_default();
    last == "-" || pointer::parse_index(last).is_some()
}

/// Patches that leave every other location, and every array index, alone.
fn is_index_stable(patch: &JsonPatch) -> bool {
    match patch.op {
        PatchOp::Replace | PatchOp::Test => true,
        PatchOp::Add | PatchOp::Remove => !is_array_slot(&patch.path),
        PatchOp::Move | PatchOp::Copy => false,
    }
}

/// Find the most recent patch `next` could fold into, looking back only
/// past index-stable patches that do not touch `next`'s locations.
fn find_candidate(out: &[JsonPatch], next: &JsonPatch) -> Option<usize> {
    for (index, prev) in out.iter().enumerate().rev() {
        let chains = next.op == PatchOp::Move
            && prev.op == PatchOp::Move
            && next.from.as_deref() == Some(prev.path.as_str());
        if prev.path == next.path || chains {
            return Some(index);
        }
        let passable = is_index_stable(prev)
            && !pointer::overlaps(&prev.path, &next.path)
            && next
                .from
                .as_deref()
                .map_or(true, |from| !pointer::overlaps(&prev.path, from));
        if !passable {
            return None;
        }
    }
    None
}

fn fold(prev: &JsonPatch, next: &JsonPatch, adjacent: bool) -> Option<Fold> {
    if prev.op == PatchOp::Move && next.op == PatchOp::Move {
        if !adjacent
            || next.from.as_deref() != Some(prev.path.as_str())
            || !is_array_slot(&prev.path)
        {
            return None;
        }
        let origin = prev.from.clone()?;
        return Some(Fold::Merge(JsonPatch::move_from(origin, next.path.clone())));
    }

    if prev.path != next.path || is_append(&next.path) {
        return None;
    }
    if !adjacent && !is_index_stable(prev) {
        return None;
    }

    match (prev.op, next.op) {
        (PatchOp::Add, PatchOp::Replace) => {
            let value = next.value.clone()?;
            Some(Fold::Merge(JsonPatch::add(next.path.clone(), value)))
        }
        (PatchOp::Replace, PatchOp::Replace) => Some(Fold::Merge(next.clone())),
        (PatchOp::Add, PatchOp::Remove) if is_array_slot(&next.path) => Some(Fold::Cancel),
        (PatchOp::Replace, PatchOp::Remove) => Some(Fold::Merge(next.clone())),
        (PatchOp::Test, PatchOp::Test) => match (&prev.value, &next.value) {
            (Some(a), Some(b)) if deep_equal(a, b) => Some(Fold::DropIncoming),
            _ => None,
        },
        _ => None,
    }
}

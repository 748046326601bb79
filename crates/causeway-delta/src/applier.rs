//! Patch application with optional validation and all-or-nothing batches.
//!
//! In atomic mode a batch either applies completely or leaves the original
//! document untouched: work happens on a private copy that only replaces the
//! caller's value once every patch succeeded. In non-atomic mode each patch
//! stands alone and failures are recorded individually.

use crate::error::PatchError;
use crate::patch::{JsonPatch, PatchOp};
use causeway_core::pointer;
use causeway_core::value::{deep_equal, type_name};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration for patch application.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplierConfig {
    /// Discard the whole batch on the first failure.
    pub atomic: bool,
    /// Check every patch's shape before touching the document.
    pub validate: bool,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        ApplierConfig {
            atomic: true,
            validate: true,
        }
    }
}

/// A patch that could not be applied.
#[derive(Clone, Debug, PartialEq)]
pub struct FailedPatch {
    pub index: usize,
    pub patch: JsonPatch,
    pub error: PatchError,
}

/// Counts of an in-place application.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: Vec<FailedPatch>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of applying a batch to a borrowed document.
#[derive(Clone, Debug)]
pub struct ApplyResult {
    /// The resulting document (the original one after an atomic failure).
    pub state: Value,
    pub applied: usize,
    pub failed: Vec<FailedPatch>,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// First failure, if any.
    pub fn first_error(&self) -> Option<&PatchError> {
        self.failed
            .iter()
            .map(|f| &f.error)
            .find(|e| !matches!(e, PatchError::Aborted { .. }))
    }
}

/// Applies patch lists to JSON documents.
#[derive(Clone, Debug, Default)]
pub struct PatchApplier {
    config: ApplierConfig,
}

impl PatchApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ApplierConfig) -> Self {
        PatchApplier { config }
    }

    pub fn config(&self) -> &ApplierConfig {
        &self.config
    }

    /// Apply to a copy of `state`; the input is never modified.
    pub fn apply(&self, state: &Value, patches: &[JsonPatch]) -> ApplyResult {
        let mut working = state.clone();
        let report = self.run(&mut working, patches);
        let state = if self.config.atomic && !report.is_success() {
            state.clone()
        } else {
            working
        };
        ApplyResult {
            state,
            applied: report.applied,
            failed: report.failed,
        }
    }

    /// Apply directly to `state`. In atomic mode `state` is only replaced
    /// when the whole batch succeeds.
    pub fn apply_in_place(&self, state: &mut Value, patches: &[JsonPatch]) -> ApplyReport {
        if !self.config.atomic {
            return self.run(state, patches);
        }
        let mut working = state.clone();
        let report = self.run(&mut working, patches);
        if report.is_success() {
            *state = working;
        }
        report
    }

    fn run(&self, doc: &mut Value, patches: &[JsonPatch]) -> ApplyReport {
        if self.config.validate {
            let errors: Vec<(usize, PatchError)> = patches
                .iter()
                .enumerate()
                .filter_map(|(i, p)| p.validate(i).err().map(|e| (i, e)))
                .collect();
            if let Some(&(first, _)) = errors.first() {
                tracing::debug!(invalid = errors.len(), "rejecting malformed patch batch");
                return reject_all(patches, first, errors);
            }
        }

        let mut report = ApplyReport::default();
        for (index, patch) in patches.iter().enumerate() {
            match apply_one(doc, patch, index) {
                Ok(()) => report.applied += 1,
                Err(error) => {
                    tracing::debug!(index, op = %patch.op, path = %patch.path, %error, "patch failed");
                    if self.config.atomic {
                        return reject_all(patches, index, vec![(index, error)]);
                    }
                    report.failed.push(FailedPatch {
                        index,
                        patch: patch.clone(),
                        error,
                    });
                }
            }
        }
        report
    }
}

/// Report every patch as failed: the listed ones with their own error, the
/// rest as aborted by `cause_index`.
fn reject_all(
    patches: &[JsonPatch],
    cause_index: usize,
    mut errors: Vec<(usize, PatchError)>,
) -> ApplyReport {
    let failed = patches
        .iter()
        .enumerate()
        .map(|(index, patch)| {
            let error = match errors.iter().position(|(i, _)| *i == index) {
                Some(pos) => errors.swap_remove(pos).1,
                None => PatchError::Aborted { cause_index },
            };
            FailedPatch {
                index,
                patch: patch.clone(),
                error,
            }
        })
        .collect();
    ApplyReport { applied: 0, failed }
}

fn required_value(patch: &JsonPatch, index: usize) -> Result<Value, PatchError> {
    patch.value.clone().ok_or_else(|| PatchError::Validation {
        index,
        reason: format!("'{}' requires a value", patch.op),
    })
}

fn required_from(patch: &JsonPatch, index: usize) -> Result<&str, PatchError> {
    patch.from.as_deref().ok_or_else(|| PatchError::Validation {
        index,
        reason: format!("'{}' requires a from pointer", patch.op),
    })
}

/// Apply one patch. A failing patch leaves `doc` as it was.
pub fn apply_one(doc: &mut Value, patch: &JsonPatch, index: usize) -> Result<(), PatchError> {
    match patch.op {
        PatchOp::Add => add_at(doc, &patch.path, required_value(patch, index)?),
        PatchOp::Remove => remove_at(doc, &patch.path).map(|_| ()),
        PatchOp::Replace => replace_at(doc, &patch.path, required_value(patch, index)?),
        PatchOp::Move => {
            let from = required_from(patch, index)?;
            if from == patch.path {
                // Still has to exist.
                return get_at(doc, from).map(|_| ());
            }
            if pointer::is_strict_ancestor(from, &patch.path) {
                return Err(PatchError::InvalidMove {
                    from: from.to_string(),
                    path: patch.path.clone(),
                });
            }
            let value = remove_at(doc, from)?;
            if let Err(err) = add_at(doc, &patch.path, value.clone()) {
                // Put the value back where it came from.
                let _ = add_at(doc, from, value);
                return Err(err);
            }
            Ok(())
        }
        PatchOp::Copy => {
            let from = required_from(patch, index)?;
            let value = get_at(doc, from)?.clone();
            add_at(doc, &patch.path, value)
        }
        PatchOp::Test => {
            let expected = required_value(patch, index)?;
            let actual = get_at(doc, &patch.path).ok();
            match actual {
                Some(actual) if deep_equal(actual, &expected) => Ok(()),
                _ => Err(PatchError::TestFailed {
                    path: patch.path.clone(),
                    expected,
                    actual: actual.cloned(),
                }),
            }
        }
    }
}

/// Resolve a pointer to a shared reference.
pub fn get_at<'a>(doc: &'a Value, path: &str) -> Result<&'a Value, PatchError> {
    let mut current = doc;
    for token in pointer::parse(path)? {
        current = match current {
            Value::Object(map) => map
                .get(&token)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(items) => pointer::parse_index(&token)
                .and_then(|i| items.get(i))
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            _ => return Err(PatchError::PathNotFound(path.to_string())),
        };
    }
    Ok(current)
}

/// Walk to the container addressed by `tokens`.
fn container_mut<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    path: &str,
) -> Result<&'a mut Value, PatchError> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(items) => pointer::parse_index(token)
                .and_then(move |i| items.get_mut(i))
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            _ => return Err(PatchError::PathNotFound(path.to_string())),
        };
    }
    Ok(current)
}

fn array_index(token: &str, len: usize, allow_end: bool, path: &str) -> Result<usize, PatchError> {
    let invalid = || PatchError::InvalidIndex {
        path: path.to_string(),
        token: token.to_string(),
    };
    if token == "-" {
        return if allow_end { Ok(len) } else { Err(invalid()) };
    }
    let index = pointer::parse_index(token).ok_or_else(invalid)?;
    let in_bounds = if allow_end { index <= len } else { index < len };
    if in_bounds {
        Ok(index)
    } else {
        Err(invalid())
    }
}

fn not_a_container(path: &str, found: &Value) -> PatchError {
    PatchError::TypeMismatch {
        path: path.to_string(),
        expected: "object or array".to_string(),
        found: type_name(found).to_string(),
    }
}

/// Insert at a location: object key set, array splice, or `-` append.
pub fn add_at(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    let tokens = pointer::parse(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    match container_mut(doc, parents, path)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(last, items.len(), true, path)?;
            items.insert(index, value);
            Ok(())
        }
        other => Err(not_a_container(path, other)),
    }
}

/// Remove and return the value at a location.
pub fn remove_at(doc: &mut Value, path: &str) -> Result<Value, PatchError> {
    let tokens = pointer::parse(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        return Err(PatchError::InvalidPointer(
            "the document root cannot be removed".to_string(),
        ));
    };
    match container_mut(doc, parents, path)? {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| PatchError::PathNotFound(path.to_string())),
        Value::Array(items) => {
            let index = array_index(last, items.len(), false, path)?;
            Ok(items.remove(index))
        }
        other => Err(not_a_container(path, other)),
    }
}

/// Overwrite an existing location.
pub fn replace_at(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    let tokens = pointer::parse(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    match container_mut(doc, parents, path)? {
        Value::Object(map) => match map.get_mut(last) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(PatchError::PathNotFound(path.to_string())),
        },
        Value::Array(items) => {
            let index = array_index(last, items.len(), false, path)?;
            items[index] = value;
            Ok(())
        }
        other => Err(not_a_container(path, other)),
    }
}

//! Structural diff producing JSON Patch lists.
//!
//! The generator walks both documents depth-first:
//! - equal subtrees produce nothing
//! - object keys are diffed over the union of both key sets
//! - arrays are diffed index by index; surplus old elements are removed
//!   from the highest index down so earlier indices stay valid, surplus new
//!   elements are appended with `add`
//! - any type or scalar change is a `replace`

use crate::patch::JsonPatch;
use causeway_core::pointer;
use causeway_core::value::deep_equal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration for patch generation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Beyond this depth a differing subtree is replaced wholesale.
    pub max_depth: usize,
    /// Pointer prefixes that are never diffed. Without a wildcard the entry
    /// matches itself and its descendants; a trailing `*` matches any raw
    /// string continuation (`/meta/*` matches `/meta/a` but not `/metadata`).
    pub exclude_paths: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            max_depth: 32,
            exclude_paths: Vec::new(),
        }
    }
}

/// Stateless diff engine.
#[derive(Clone, Debug, Default)]
pub struct PatchGenerator {
    config: GeneratorConfig,
}

impl PatchGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: GeneratorConfig) -> Self {
        PatchGenerator { config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Compute the patches turning `old` into `new`.
    pub fn generate(&self, old: &Value, new: &Value) -> Vec<JsonPatch> {
        let mut patches = Vec::new();
        self.diff(old, new, "", 0, &mut patches);
        patches
    }

    /// Whether a pointer falls under one of the excluded prefixes.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.config.exclude_paths.iter().any(|pattern| {
            match pattern.strip_suffix('*') {
                Some(prefix) => path.starts_with(prefix),
                None => path == pattern || pointer::is_strict_ancestor(pattern, path),
            }
        })
    }

    fn diff(&self, old: &Value, new: &Value, path: &str, depth: usize, out: &mut Vec<JsonPatch>) {
        if self.is_excluded(path) || deep_equal(old, new) {
            return;
        }
        if depth >= self.config.max_depth {
            out.push(JsonPatch::replace(path, new.clone()));
            return;
        }

        match (old, new) {
            (Value::Object(before), Value::Object(after)) => {
                for (key, old_child) in before {
                    let child = pointer::child(path, key);
                    match after.get(key) {
                        Some(new_child) => self.diff(old_child, new_child, &child, depth + 1, out),
                        None => {
                            if !self.is_excluded(&child) {
                                out.push(JsonPatch::remove(child));
                            }
                        }
                    }
                }
                for (key, new_child) in after {
                    if before.contains_key(key) {
                        continue;
                    }
                    let child = pointer::child(path, key);
                    if !self.is_excluded(&child) {
                        out.push(JsonPatch::add(child, new_child.clone()));
                    }
                }
            }
            (Value::Array(before), Value::Array(after)) => {
                let common = before.len().min(after.len());
                for i in 0..common {
                    let child = pointer::child(path, &i.to_string());
                    self.diff(&before[i], &after[i], &child, depth + 1, out);
                }
                if after.len() > before.len() {
                    for (i, item) in after.iter().enumerate().skip(before.len()) {
                        out.push(JsonPatch::add(
                            pointer::child(path, &i.to_string()),
                            item.clone(),
                        ));
                    }
                } else {
                    for i in (after.len()..before.len()).rev() {
                        out.push(JsonPatch::remove(pointer::child(path, &i.to_string())));
                    }
                }
            }
            _ => out.push(JsonPatch::replace(path, new.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchOp;
    use serde_json::json;

    #[test]
    fn test_scalar_replace() {
        let patches = PatchGenerator::new().generate(&json!({"value": 1}), &json!({"value": 3}));
        assert_eq!(patches, vec![JsonPatch::replace("/value", json!(3))]);
    }

    #[test]
    fn test_equal_documents_yield_nothing() {
        let doc = json!({"a": [1, 2, {"b": null}], "c": "x"});
        assert!(PatchGenerator::new().generate(&doc, &doc).is_empty());
        assert!(PatchGenerator::new()
            .generate(&json!({"n": 1}), &json!({"n": 1.0}))
            .is_empty());
    }

    #[test]
    fn test_added_and_removed_keys() {
        let patches = PatchGenerator::new().generate(&json!({"a": 1, "b": 2}), &json!({"a": 1, "c": 3}));
        assert_eq!(
            patches,
            vec![JsonPatch::remove("/b"), JsonPatch::add("/c", json!(3))]
        );
    }

    #[test]
    fn test_null_transitions_are_replace() {
        let patches = PatchGenerator::new().generate(&json!({"a": null}), &json!({"a": 5}));
        assert_eq!(patches, vec![JsonPatch::replace("/a", json!(5))]);
    }

    #[test]
    fn test_array_shrink_removes_from_the_end() {
        let patches = PatchGenerator::new().generate(&json!([1, 2, 3, 4]), &json!([1, 9]));
        assert_eq!(
            patches,
            vec![
                JsonPatch::replace("/1", json!(9)),
                JsonPatch::remove("/3"),
                JsonPatch::remove("/2"),
            ]
        );
    }

    #[test]
    fn test_array_grow_appends() {
        let patches = PatchGenerator::new().generate(&json!({"l": [1]}), &json!({"l": [1, 2, 3]}));
        assert_eq!(
            patches,
            vec![
                JsonPatch::add("/l/1", json!(2)),
                JsonPatch::add("/l/2", json!(3)),
            ]
        );
    }

    #[test]
    fn test_keys_are_escaped() {
        let patches = PatchGenerator::new().generate(&json!({}), &json!({"a/b": 1, "t~": 2}));
        let paths: Vec<_> = patches.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["/a~1b", "/t~0"]);
    }

    #[test]
    fn test_max_depth_replaces_subtree() {
        let generator = PatchGenerator::with_config(GeneratorConfig {
            max_depth: 1,
            ..Default::default()
        });
        let patches = generator.generate(
            &json!({"a": {"b": {"c": 1}}}),
            &json!({"a": {"b": {"c": 2}}}),
        );
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].op, PatchOp::Replace);
        assert_eq!(patches[0].path, "/a");
        assert_eq!(patches[0].value, Some(json!({"b": {"c": 2}})));
    }

    #[test]
    fn test_excluded_paths() {
        let generator = PatchGenerator::with_config(GeneratorConfig {
            exclude_paths: vec!["/meta/*".to_string(), "/cache".to_string()],
            ..Default::default()
        });
        let patches = generator.generate(
            &json!({"meta": {"t": 1}, "cache": {"x": 1}, "cached": 1, "v": 1}),
            &json!({"meta": {"t": 2}, "cache": {"x": 2}, "cached": 2, "v": 2}),
        );
        let paths: Vec<_> = patches.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["/cached", "/v"]);
    }

    #[test]
    fn test_root_type_change() {
        let patches = PatchGenerator::new().generate(&json!(null), &json!({"a": 1}));
        assert_eq!(patches, vec![JsonPatch::replace("", json!({"a": 1}))]);
    }
}

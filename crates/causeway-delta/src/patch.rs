//! RFC 6902 patch operations.

use crate::error::PatchError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// The six JSON Patch operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

impl PatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOp::Add => "add",
            PatchOp::Remove => "remove",
            PatchOp::Replace => "replace",
            PatchOp::Move => "move",
            PatchOp::Copy => "copy",
            PatchOp::Test => "test",
        }
    }

    /// Whether the operation carries a `value`.
    pub fn requires_value(&self) -> bool {
        matches!(self, PatchOp::Add | PatchOp::Replace | PatchOp::Test)
    }

    /// Whether the operation carries a `from` pointer.
    pub fn requires_from(&self) -> bool {
        matches!(self, PatchOp::Move | PatchOp::Copy)
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single patch operation.
///
/// `value` distinguishes an explicit JSON `null` (`Some(Value::Null)`) from an
/// absent field (`None`), so `{"op":"add","path":"/a","value":null}` is valid
/// while `{"op":"add","path":"/a"}` is not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonPatch {
    pub op: PatchOp,
    pub path: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl JsonPatch {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        JsonPatch {
            op: PatchOp::Add,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        JsonPatch {
            op: PatchOp::Remove,
            path: path.into(),
            value: None,
            from: None,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        JsonPatch {
            op: PatchOp::Replace,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }

    pub fn move_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        JsonPatch {
            op: PatchOp::Move,
            path: path.into(),
            value: None,
            from: Some(from.into()),
        }
    }

    pub fn copy_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        JsonPatch {
            op: PatchOp::Copy,
            path: path.into(),
            value: None,
            from: Some(from.into()),
        }
    }

    pub fn test(path: impl Into<String>, value: Value) -> Self {
        JsonPatch {
            op: PatchOp::Test,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }

    /// Check required fields for the operation. `index` is only used for the
    /// error report.
    pub fn validate(&self, index: usize) -> Result<(), PatchError> {
        if !self.path.is_empty() && !self.path.starts_with('/') {
            return Err(PatchError::Validation {
                index,
                reason: format!("path '{}' must be empty or start with '/'", self.path),
            });
        }
        if self.op.requires_value() && self.value.is_none() {
            return Err(PatchError::Validation {
                index,
                reason: format!("'{}' requires a value", self.op),
            });
        }
        if self.op.requires_from() {
            match &self.from {
                None => {
                    return Err(PatchError::Validation {
                        index,
                        reason: format!("'{}' requires a from pointer", self.op),
                    })
                }
                Some(from) if !from.is_empty() && !from.starts_with('/') => {
                    return Err(PatchError::Validation {
                        index,
                        reason: format!("from '{}' must be empty or start with '/'", from),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Validate a whole patch list, stopping at the first malformed entry.
pub fn validate_all(patches: &[JsonPatch]) -> Result<(), PatchError> {
    patches
        .iter()
        .enumerate()
        .try_for_each(|(index, patch)| patch.validate(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let patch = JsonPatch::replace("/value", json!(3));
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, json!({"op": "replace", "path": "/value", "value": 3}));

        let mv = JsonPatch::move_from("/a", "/b");
        let json = serde_json::to_value(&mv).unwrap();
        assert_eq!(json, json!({"op": "move", "path": "/b", "from": "/a"}));
    }

    #[test]
    fn test_explicit_null_is_a_value() {
        let patch: JsonPatch =
            serde_json::from_str(r#"{"op":"add","path":"/a","value":null}"#).unwrap();
        assert_eq!(patch.value, Some(Value::Null));
        assert!(patch.validate(0).is_ok());

        let missing: JsonPatch = serde_json::from_str(r#"{"op":"add","path":"/a"}"#).unwrap();
        assert_eq!(missing.value, None);
        assert!(matches!(
            missing.validate(4),
            Err(PatchError::Validation { index: 4, .. })
        ));
    }

    #[test]
    fn test_validate_from() {
        let patch: JsonPatch = serde_json::from_str(r#"{"op":"copy","path":"/b"}"#).unwrap();
        assert!(patch.validate(0).is_err());
        assert!(JsonPatch::copy_from("/a", "/b").validate(0).is_ok());
    }

    #[test]
    fn test_validate_all_reports_first_bad_index() {
        let patches = vec![
            JsonPatch::remove("/a"),
            JsonPatch::remove("bad"),
            JsonPatch::remove("also-bad"),
        ];
        match validate_all(&patches) {
            Err(PatchError::Validation { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected: {:?}", other),
        }
    }
}

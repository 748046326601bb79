//! SHA-256 checksums for states, patch lists and snapshots.
//!
//! Checksums are computed over the canonical JSON serialization of a value
//! (object keys sorted at every level, integral numbers written without a
//! fraction), so two documents that compare equal with
//! [`deep_equal`](crate::value::deep_equal) always hash to the same digest.

use crate::error::CoreError;
use crate::value::to_canonical_string;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A SHA-256 digest. Serialized as a lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Checksum(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Leading four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Checksum of any serializable value via its canonical JSON form.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self, CoreError> {
        let value = serde_json::to_value(value)?;
        Ok(Self::of_value(&value))
    }

    /// Checksum of a JSON document.
    pub fn of_value(value: &Value) -> Self {
        let mut hasher = Hasher::new();
        hasher.update_value(value);
        hasher.finish()
    }

    /// Recompute over `value` and compare.
    pub fn verify<T: Serialize + ?Sized>(&self, value: &T) -> Result<bool, CoreError> {
        Ok(Checksum::of(value)? == *self)
    }
}

impl FromStr for Checksum {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| CoreError::InvalidChecksum(format!("{s:?}: {e}")))?;
        Ok(Checksum(bytes))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({}..)", self.short())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Accumulates documents and raw bytes into one checksum.
///
/// Each document is fed in canonical form followed by a newline, so a
/// sequence of documents hashes differently from their concatenation.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_value(&mut self, value: &Value) -> &mut Self {
        self.inner.update(to_canonical_string(value).as_bytes());
        self.inner.update(b"\n");
        self
    }

    pub fn update_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    pub fn finish(self) -> Checksum {
        Checksum(self.inner.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_ignores_key_order() {
        let a = Checksum::of(&json!({"b": 1, "a": [1, 2]})).unwrap();
        let b = Checksum::of(&json!({"a": [1, 2], "b": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_equal_numbers_hash_alike() {
        let int = Checksum::of_value(&json!({"count": 3, "ratio": [0, -0.0]}));
        let float = Checksum::of_value(&json!({"count": 3.0, "ratio": [0.0, 0]}));
        assert_eq!(int, float);
        assert_ne!(int, Checksum::of_value(&json!({"count": 3.5, "ratio": [0, 0]})));
    }

    #[test]
    fn test_checksum_detects_change() {
        let a = Checksum::of(&json!({"value": 1})).unwrap();
        let b = Checksum::of(&json!({"value": 2})).unwrap();
        assert_ne!(a, b);
        assert!(a.verify(&json!({"value": 1})).unwrap());
        assert!(!a.verify(&json!({"value": 2})).unwrap());
    }

    #[test]
    fn test_document_sequence_is_not_concatenation() {
        let mut split = Hasher::new();
        split.update_value(&json!("ab")).update_value(&json!("c"));
        let mut joined = Hasher::new();
        joined.update_value(&json!("abc"));
        assert_ne!(split.finish(), joined.finish());
    }

    #[test]
    fn test_parse_rejects_malformed_digests() {
        let sum = Checksum::of_value(&json!({"state": "s1"}));
        assert_eq!(sum.to_hex().parse::<Checksum>().unwrap(), sum);
        assert_eq!(sum.to_hex().to_uppercase().parse::<Checksum>().unwrap(), sum);

        for bad in ["", "zz", &sum.to_hex()[..62]] {
            let err = bad.parse::<Checksum>().unwrap_err();
            assert!(matches!(err, CoreError::InvalidChecksum(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn test_wire_form_is_hex_string() {
        let sum = Checksum::of_value(&json!([1, 2, 3]));
        let wire = serde_json::to_string(&sum).unwrap();
        assert_eq!(wire, format!("\"{}\"", sum));
        assert_eq!(sum.short().len(), 8);
        assert!(serde_json::from_str::<Checksum>("\"not-hex\"").is_err());
        assert_eq!(serde_json::from_str::<Checksum>(&wire).unwrap(), sum);
    }
}

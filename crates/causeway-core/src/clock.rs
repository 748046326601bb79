//! Vector clock for causal ordering of state versions.
//!
//! A vector clock maps each writer to the number of updates it has made.
//! Comparing two clocks tells whether one version causally precedes the
//! other, follows it, is identical to it, or was produced concurrently.
//!
//! All operations are pure: the `increment`/`merge` family returns a new
//! clock and never touches `self`, so clocks can be shared freely across
//! threads.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Result of comparing two vector clocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockOrdering {
    /// Every component of `self` is ≤ `other`, at least one strictly.
    Before,
    /// Every component of `self` is ≥ `other`, at least one strictly.
    After,
    /// All components are equal (missing entries count as 0).
    Equal,
    /// Some components are greater and some are lesser.
    Concurrent,
}

/// A vector clock tracking per-writer update counters.
///
/// Entries are kept in a `BTreeMap` so iteration, serialization and the
/// canonical string form are always sorted by writer id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        VectorClock {
            entries: BTreeMap::new(),
        }
    }

    /// Create a clock for a writer with its own counter at 0.
    pub fn for_writer(writer_id: impl Into<String>) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(writer_id.into(), 0);
        VectorClock { entries }
    }

    /// Create a clock from explicit entries.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, u64)>) -> Self {
        VectorClock {
            entries: entries.into_iter().collect(),
        }
    }

    /// Counter for a writer (0 when absent).
    pub fn get(&self, writer_id: &str) -> u64 {
        self.entries.get(writer_id).copied().unwrap_or(0)
    }

    /// Return a copy of this clock with `writer_id`'s counter incremented.
    pub fn increment(&self, writer_id: &str) -> VectorClock {
        let mut next = self.clone();
        *next.entries.entry(writer_id.to_string()).or_insert(0) += 1;
        next
    }

    /// Component-wise maximum of two clocks.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        for (writer_id, &count) in &other.entries {
            let current = result.entries.entry(writer_id.clone()).or_insert(0);
            *current = (*current).max(count);
        }
        result
    }

    /// Compare over the union of writer ids, treating missing entries as 0.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut greater = false;
        let mut lesser = false;

        for writer_id in self.entries.keys().chain(other.entries.keys()) {
            let ours = self.get(writer_id);
            let theirs = other.get(writer_id);
            if ours > theirs {
                greater = true;
            } else if ours < theirs {
                lesser = true;
            }
            if greater && lesser {
                return ClockOrdering::Concurrent;
            }
        }

        match (greater, lesser) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn is_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    pub fn is_after(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::After
    }

    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    pub fn is_equal(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Equal
    }

    /// True when `self` is before or equal to `other`.
    pub fn is_before_or_equal(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::Before | ClockOrdering::Equal
        )
    }

    /// Scalar causal weight (sum of all counters), used for tie-breaking.
    pub fn sum(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Iterate over `(writer, counter)` pairs in writer order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.entries.iter()
    }

    /// Number of writers tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl Eq for VectorClock {}

/// Canonical form: `writer:count` pairs sorted by writer, comma separated.
impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (writer_id, count) in &self.entries {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}:{}", writer_id, count)?;
        }
        Ok(())
    }
}

impl FromStr for VectorClock {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = BTreeMap::new();
        if s.trim().is_empty() {
            return Ok(VectorClock { entries });
        }
        for part in s.split(',') {
            // Writer ids may themselves contain ':', the counter never does.
            let (writer_id, count) = part
                .rsplit_once(':')
                .ok_or_else(|| CoreError::InvalidClock(s.to_string()))?;
            if writer_id.is_empty() {
                return Err(CoreError::InvalidClock(s.to_string()));
            }
            let count: u64 = count
                .parse()
                .map_err(|_| CoreError::InvalidClock(s.to_string()))?;
            entries.insert(writer_id.to_string(), count);
        }
        Ok(VectorClock { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(entries.iter().map(|(w, c)| (w.to_string(), *c)))
    }

    #[test]
    fn test_for_writer_starts_at_zero() {
        let vc = VectorClock::for_writer("c1");
        assert_eq!(vc.get("c1"), 0);
        assert_eq!(vc.len(), 1);
        assert!(vc.is_equal(&VectorClock::new()));
    }

    #[test]
    fn test_increment_is_pure() {
        let vc = VectorClock::for_writer("c1");
        let next = vc.increment("c1");
        assert_eq!(vc.get("c1"), 0);
        assert_eq!(next.get("c1"), 1);
        assert!(vc.is_before(&next));
        assert!(next.is_after(&vc));
    }

    #[test]
    fn test_compare_concurrent() {
        let a = clock(&[("c1", 1)]);
        let b = clock(&[("c2", 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare(&a), ClockOrdering::Concurrent);
    }

    #[test]
    fn test_merge_is_componentwise_max() {
        let a = clock(&[("c1", 5), ("c2", 3)]);
        let b = clock(&[("c1", 3), ("c2", 7), ("c3", 1)]);
        let merged = a.merge(&b);
        assert_eq!(merged.get("c1"), 5);
        assert_eq!(merged.get("c2"), 7);
        assert_eq!(merged.get("c3"), 1);
        assert!(merged.is_after(&a));
        assert!(merged.is_after(&b));
    }

    #[test]
    fn test_string_roundtrip() {
        let vc = clock(&[("zeta", 2), ("alpha", 10)]);
        let s = vc.to_string();
        assert_eq!(s, "alpha:10,zeta:2");
        let parsed: VectorClock = s.parse().unwrap();
        assert_eq!(parsed, vc);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("alpha".parse::<VectorClock>().is_err());
        assert!("alpha:x".parse::<VectorClock>().is_err());
        assert!(":3".parse::<VectorClock>().is_err());
        assert!("".parse::<VectorClock>().unwrap().is_empty());
    }

    #[test]
    fn test_sum() {
        assert_eq!(clock(&[("a", 2), ("b", 3)]).sum(), 5);
        assert_eq!(VectorClock::new().sum(), 0);
    }

    #[test]
    fn test_serialization_is_plain_map() {
        let vc = clock(&[("c1", 1), ("c2", 4)]);
        let json = serde_json::to_string(&vc).unwrap();
        assert_eq!(json, r#"{"c1":1,"c2":4}"#);
        let back: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vc);
    }
}

//! # causeway-core
//!
//! Leaf primitives shared by every Causeway crate:
//! - [`VectorClock`] for causal ordering between independent writers
//! - [`Checksum`] (SHA-256) for integrity of states and patch lists
//! - [`pointer`] for RFC 6901 JSON Pointer handling
//! - [`value`] helpers for deep equality and canonical serialization
//!
//! ## Example
//!
//! ```rust
//! use causeway_core::{ClockOrdering, VectorClock};
//!
//! let base = VectorClock::for_writer("c1");
//! let a = base.increment("c1");
//! let b = base.increment("c2");
//!
//! assert!(base.is_before(&a));
//! assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
//! assert_eq!(a.merge(&b).to_string(), "c1:1,c2:1");
//! ```

pub mod checksum;
pub mod clock;
pub mod error;
pub mod pointer;
pub mod value;

pub use checksum::{Checksum, Hasher};
pub use clock::{ClockOrdering, VectorClock};
pub use error::{CoreError, Result};

/// Generate a new unique, time-sortable identifier.
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

//! # causeway-delta
//!
//! The JSON-Patch delta protocol: instead of shipping whole documents,
//! replicas exchange RFC 6902 patch lists wrapped in versioned, checksummed
//! messages.
//!
//! ## Pipeline
//!
//! ```text
//! sender:    generate(old, new) → optimize → checksum → compress?  → PatchMessage
//! receiver:  PatchMessage → decompress? → verify checksum → apply (atomic)
//! ```
//!
//! - [`PatchGenerator`] computes a structural diff
//! - [`PatchOptimizer`] folds redundant operations
//! - [`PatchCompressor`] zlib + base64 encodes large payloads
//! - [`PatchApplier`] applies lists atomically or patch-by-patch
//! - [`ConflictResolver`] merges concurrent patch sets
//! - [`DeltaSyncEngine`] ties the above together and answers sync requests
//!
//! # Example
//!
//! ```rust
//! use causeway_core::VectorClock;
//! use causeway_delta::DeltaSyncEngine;
//! use serde_json::json;
//!
//! let engine = DeltaSyncEngine::new();
//! let v0 = VectorClock::for_writer("server-1");
//! let v1 = v0.increment("server-1");
//!
//! let old = json!({"value": 1});
//! let new = json!({"value": 3});
//! let message = engine.create_patch_message(&old, &new, &v0, &v1).unwrap();
//!
//! let result = engine.apply_patch_message(&old, &v0, &message).unwrap();
//! assert_eq!(result.state, new);
//! ```

pub mod applier;
pub mod compressor;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod generator;
pub mod message;
pub mod optimizer;
pub mod patch;

pub use applier::{ApplierConfig, ApplyReport, ApplyResult, FailedPatch, PatchApplier};
pub use compressor::{CompressedData, CompressionConfig, PatchCompressor};
pub use conflict::{
    ConflictResolver, PatchConflict, PatchConflictStrategy, PatchMergeOutcome, Resolution,
    ResolvedConflict,
};
pub use engine::{DeltaSyncEngine, SyncEngineConfig, SyncEngineConfigBuilder};
pub use error::{PatchError, Result, SyncError};
pub use generator::{GeneratorConfig, PatchGenerator};
pub use message::{MessageLog, PatchMessage, PatchPayload, SyncMessage};
pub use optimizer::PatchOptimizer;
pub use patch::{JsonPatch, PatchOp};

//! Schema migrations for stored documents.
//!
//! Steps are registered per source version and always upgrade by exactly
//! one version. A document is migrated by running every step from its
//! version up to the latest; a missing step, a failing step or a request to
//! go backwards is an error and the document is left as it was.

use crate::error::{Result, StateError};
use serde_json::Value;
use std::collections::BTreeMap;

/// Upgrades a document from version `n` to `n + 1`.
pub type MigrationFn = Box<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

#[derive(Default)]
pub struct SchemaMigrator {
    steps: BTreeMap<u32, MigrationFn>,
}

impl SchemaMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step `from` → `from + 1`.
    pub fn register<F>(mut self, from: u32, step: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.steps.insert(from, Box::new(step));
        self
    }

    /// The version every document is migrated to.
    pub fn latest_version(&self) -> u32 {
        self.steps.keys().next_back().map_or(0, |v| v + 1)
    }

    pub fn needs_migration(&self, version: u32) -> bool {
        version < self.latest_version()
    }

    /// Migrate `doc` from `version` to the latest version.
    pub fn migrate(&self, doc: Value, version: u32) -> Result<Value> {
        let latest = self.latest_version();
        if version > latest {
            return Err(StateError::Migration {
                from: version,
                to: latest,
                reason: "documents are never downgraded".to_string(),
            });
        }

        let mut doc = doc;
        for from in version..latest {
            let step = self.steps.get(&from).ok_or_else(|| StateError::Migration {
                from,
                to: from + 1,
                reason: "no migration registered".to_string(),
            })?;
            doc = step(doc).map_err(|reason| {
                tracing::warn!(from, to = from + 1, %reason, "schema migration failed");
                StateError::Migration {
                    from,
                    to: from + 1,
                    reason,
                }
            })?;
        }
        Ok(doc)
    }
}

//! The delta sync engine: patch generation, messaging and application.

use crate::applier::{ApplierConfig, ApplyResult, PatchApplier};
use crate::compressor::{CompressionConfig, PatchCompressor};
use crate::conflict::{ConflictResolver, PatchConflictStrategy, PatchMergeOutcome};
use crate::error::{Result, SyncError};
use crate::generator::{GeneratorConfig, PatchGenerator};
use crate::message::{MessageLog, PatchMessage, PatchPayload, SyncMessage};
use crate::optimizer::PatchOptimizer;
use crate::patch::JsonPatch;
use causeway_core::{new_id, now_millis, Checksum, VectorClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration for the sync engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncEngineConfig {
    /// Run generated and merged patch lists through the optimizer.
    pub optimize: bool,
    /// Compress message payloads above the threshold.
    pub compress: bool,
    pub compression_threshold: usize,
    pub compression_level: u32,
    pub atomic: bool,
    pub validate: bool,
    pub conflict_strategy: PatchConflictStrategy,
    pub max_depth: usize,
    pub exclude_paths: Vec<String>,
    /// How many sent messages are kept to answer sync requests.
    pub message_log_capacity: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            optimize: true,
            compress: true,
            compression_threshold: 1024,
            compression_level: 6,
            atomic: true,
            validate: true,
            conflict_strategy: PatchConflictStrategy::default(),
            max_depth: 32,
            exclude_paths: Vec::new(),
            message_log_capacity: 256,
        }
    }
}

/// Builder for sync engine configuration.
pub struct SyncEngineConfigBuilder {
    config: SyncEngineConfig,
}

impl SyncEngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncEngineConfig::default(),
        }
    }

    pub fn optimize(mut self, enabled: bool) -> Self {
        self.config.optimize = enabled;
        self
    }

    pub fn compress(mut self, enabled: bool) -> Self {
        self.config.compress = enabled;
        self
    }

    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.config.compression_threshold = bytes;
        self
    }

    pub fn compression_level(mut self, level: u32) -> Self {
        self.config.compression_level = level;
        self
    }

    pub fn atomic(mut self, enabled: bool) -> Self {
        self.config.atomic = enabled;
        self
    }

    pub fn validate(mut self, enabled: bool) -> Self {
        self.config.validate = enabled;
        self
    }

    pub fn conflict_strategy(mut self, strategy: PatchConflictStrategy) -> Self {
        self.config.conflict_strategy = strategy;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth;
        self
    }

    pub fn exclude_path(mut self, pattern: impl Into<String>) -> Self {
        self.config.exclude_paths.push(pattern.into());
        self
    }

    pub fn message_log_capacity(mut self, capacity: usize) -> Self {
        self.config.message_log_capacity = capacity;
        self
    }

    pub fn build(self) -> SyncEngineConfig {
        self.config
    }
}

impl Default for SyncEngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Composes the patch primitives into versioned, checksummed messages.
pub struct DeltaSyncEngine {
    config: SyncEngineConfig,
    generator: PatchGenerator,
    applier: PatchApplier,
    optimizer: PatchOptimizer,
    compressor: PatchCompressor,
    resolver: ConflictResolver,
    log: Mutex<MessageLog>,
}

impl DeltaSyncEngine {
    pub fn new() -> Self {
        Self::with_config(SyncEngineConfig::default())
    }

    pub fn with_config(config: SyncEngineConfig) -> Self {
        let generator = PatchGenerator::with_config(GeneratorConfig {
            max_depth: config.max_depth,
            exclude_paths: config.exclude_paths.clone(),
        });
        let applier = PatchApplier::with_config(ApplierConfig {
            atomic: config.atomic,
            validate: config.validate,
        });
        let compressor = PatchCompressor::with_config(CompressionConfig {
            threshold: config.compression_threshold,
            level: config.compression_level,
        });
        Self {
            generator,
            applier,
            optimizer: PatchOptimizer::new(),
            compressor,
            resolver: ConflictResolver::new(config.conflict_strategy),
            log: Mutex::new(MessageLog::new(config.message_log_capacity)),
            config,
        }
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn compressor(&self) -> &PatchCompressor {
        &self.compressor
    }

    /// Diff two states, optimizing the result when enabled.
    pub fn generate_patches(&self, old: &Value, new: &Value) -> Vec<JsonPatch> {
        let patches = self.generator.generate(old, new);
        if self.config.optimize {
            self.optimizer.optimize(&patches)
        } else {
            patches
        }
    }

    pub fn apply_patches(&self, state: &Value, patches: &[JsonPatch]) -> ApplyResult {
        self.applier.apply(state, patches)
    }

    /// Build the message for the transition `old` → `new` and record it in
    /// the message log.
    pub fn create_patch_message(
        &self,
        old: &Value,
        new: &Value,
        base_version: &VectorClock,
        target_version: &VectorClock,
    ) -> Result<PatchMessage> {
        let patches = self.generate_patches(old, new);
        let message = self.pack(patches, base_version, target_version)?;
        tracing::debug!(
            message_id = %message.id,
            target = %message.target_version,
            compressed = message.compressed,
            "created patch message"
        );
        self.log.lock().push(message.clone());
        Ok(message)
    }

    /// Wrap an existing patch list into a message without logging it.
    pub fn pack(
        &self,
        patches: Vec<JsonPatch>,
        base_version: &VectorClock,
        target_version: &VectorClock,
    ) -> Result<PatchMessage> {
        let checksum = Checksum::of(&patches)?;
        let (payload, compressed) = if self.config.compress {
            let packed = self.compressor.compress_patches(&patches)?;
            if packed.compressed {
                (PatchPayload::Compressed(packed.data), true)
            } else {
                (PatchPayload::Patches(patches), false)
            }
        } else {
            (PatchPayload::Patches(patches), false)
        };
        Ok(PatchMessage {
            id: new_id(),
            base_version: base_version.clone(),
            target_version: target_version.clone(),
            patches: payload,
            checksum,
            compressed,
            timestamp: now_millis(),
        })
    }

    /// Recover the patch list of a message, verifying its checksum.
    ///
    /// The checksum covers the uncompressed list, so a compressed payload is
    /// inflated first. A mismatch is always an error.
    pub fn unpack(&self, message: &PatchMessage) -> Result<Vec<JsonPatch>> {
        let patches = match &message.patches {
            PatchPayload::Patches(patches) => patches.clone(),
            PatchPayload::Compressed(blob) => {
                let text = self.compressor.inflate(blob)?;
                serde_json::from_str(&text)?
            }
        };
        let actual = Checksum::of(&patches)?;
        if actual != message.checksum {
            tracing::warn!(
                message_id = %message.id,
                expected = %message.checksum.short(),
                actual = %actual.short(),
                "rejecting patch message with bad checksum"
            );
            return Err(SyncError::InvalidChecksum {
                message_id: message.id.clone(),
                expected: message.checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(patches)
    }

    /// Verify, decompress and apply a message to `state`, whose version is
    /// `version`.
    ///
    /// The message must have been generated against exactly `version`; a
    /// receiver that is behind, ahead or concurrent gets
    /// [`SyncError::VersionMismatch`] and should resync instead.
    pub fn apply_patch_message(
        &self,
        state: &Value,
        version: &VectorClock,
        message: &PatchMessage,
    ) -> Result<ApplyResult> {
        let patches = self.unpack(message)?;
        if !message.base_version.is_equal(version) {
            tracing::debug!(
                message_id = %message.id,
                base = %message.base_version,
                local = %version,
                "rejecting patch message built against another version"
            );
            return Err(SyncError::VersionMismatch {
                message_id: message.id.clone(),
                base: message.base_version.to_string(),
                local: version.to_string(),
            });
        }
        let result = self.applier.apply(state, &patches);
        if let Some(error) = result.first_error() {
            tracing::debug!(message_id = %message.id, %error, "patch message did not apply cleanly");
        }
        Ok(result)
    }

    /// Merge two patch lists made against the same base.
    pub fn merge_patch_sets(&self, local: &[JsonPatch], incoming: &[JsonPatch]) -> PatchMergeOutcome {
        let mut outcome = self.resolver.three_way_merge(local, incoming);
        if self.config.optimize {
            outcome.patches = self.optimizer.optimize(&outcome.patches);
        }
        outcome
    }

    pub fn create_sync_request(&self, client_version: &VectorClock, state_id: Option<String>) -> SyncMessage {
        SyncMessage::Request {
            client_version: client_version.clone(),
            state_id,
        }
    }

    pub fn create_sync_response(&self, messages: Vec<PatchMessage>, server_version: &VectorClock) -> SyncMessage {
        SyncMessage::Response {
            messages,
            server_version: server_version.clone(),
        }
    }

    pub fn create_sync_ack(&self, message_id: impl Into<String>, version: &VectorClock) -> SyncMessage {
        SyncMessage::Ack {
            message_id: message_id.into(),
            version: version.clone(),
        }
    }

    pub fn create_sync_error(&self, code: impl Into<String>, message: impl Into<String>) -> SyncMessage {
        SyncMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Report an engine error to the peer.
    pub fn error_message(&self, error: &SyncError) -> SyncMessage {
        self.create_sync_error(error.code(), error.to_string())
    }

    /// Answer a request from the message log.
    pub fn handle_sync_request(&self, request: &SyncMessage) -> SyncMessage {
        match request {
            SyncMessage::Request { client_version, .. } => {
                let log = self.log.lock();
                let messages = log.messages_since(client_version);
                tracing::debug!(
                    client = %client_version,
                    messages = messages.len(),
                    "answering sync request"
                );
                SyncMessage::Response {
                    messages,
                    server_version: log.latest_version(),
                }
            }
            other => self.create_sync_error(
                "UNEXPECTED_MESSAGE",
                format!("expected a sync request, got {}", other.kind()),
            ),
        }
    }

    /// Record a message created elsewhere so it can be replayed.
    pub fn record_message(&self, message: PatchMessage) {
        self.log.lock().push(message);
    }

    pub fn logged_messages(&self) -> usize {
        self.log.lock().len()
    }
}

impl Default for DeltaSyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchOp;
    use serde_json::json;

    #[test]
    fn test_generate_patches_scalar() {
        let engine = DeltaSyncEngine::new();
        let patches = engine.generate_patches(&json!({"value": 1}), &json!({"value": 3}));
        assert_eq!(patches, vec![JsonPatch::replace("/value", json!(3))]);
        let result = engine.apply_patches(&json!({"value": 1}), &patches);
        assert_eq!(result.state, json!({"value": 3}));
    }

    #[test]
    fn test_message_round_trip() {
        let engine = DeltaSyncEngine::new();
        let v0 = VectorClock::for_writer("s1");
        let v1 = v0.increment("s1");
        let old = json!({"title": "a", "tags": []});
        let new = json!({"title": "b", "tags": ["x"]});

        let message = engine.create_patch_message(&old, &new, &v0, &v1).unwrap();
        assert!(!message.compressed);
        assert_eq!(message.base_version, v0);
        assert_eq!(message.target_version, v1);
        assert_eq!(engine.logged_messages(), 1);

        let wire = message.to_json().unwrap();
        let received = PatchMessage::from_json(&wire).unwrap();
        let result = engine.apply_patch_message(&old, &v0, &received).unwrap();
        assert!(result.is_success());
        assert_eq!(result.state, new);
    }

    #[test]
    fn test_large_message_is_compressed() {
        let engine = DeltaSyncEngine::new();
        let old = json!({"items": []});
        let items: Vec<_> = (0..100).map(|i| json!({"id": i, "label": "entry"})).collect();
        let new = json!({ "items": items });
        let v = VectorClock::for_writer("s1");

        let message = engine.create_patch_message(&old, &new, &v, &v.increment("s1")).unwrap();
        assert!(message.compressed);
        assert!(matches!(message.patches, PatchPayload::Compressed(_)));
        let result = engine.apply_patch_message(&old, &v, &message).unwrap();
        assert_eq!(result.state, new);
    }

    #[test]
    fn test_tampered_message_is_rejected() {
        let engine = DeltaSyncEngine::new();
        let v = VectorClock::for_writer("s1");
        let mut message = engine
            .create_patch_message(&json!({"a": 1}), &json!({"a": 2}), &v, &v.increment("s1"))
            .unwrap();
        message.patches = PatchPayload::Patches(vec![JsonPatch::replace("/a", json!(999))]);

        let err = engine.apply_patch_message(&json!({"a": 1}), &v, &message).unwrap_err();
        assert_eq!(err.code(), "INVALID_CHECKSUM");
    }

    #[test]
    fn test_message_for_another_version_is_rejected() {
        let engine = DeltaSyncEngine::new();
        let v0 = VectorClock::for_writer("s1");
        let v5 = (0..5).fold(v0.clone(), |v, _| v.increment("s1"));
        let message = engine
            .create_patch_message(&json!({"a": 1}), &json!({"a": 2}), &v5, &v5.increment("s1"))
            .unwrap();

        // The paths resolve on the older document, but its version differs.
        let err = engine.apply_patch_message(&json!({"a": 1}), &v0, &message).unwrap_err();
        assert_eq!(err.code(), "VERSION_MISMATCH");
        assert!(matches!(err, SyncError::VersionMismatch { ref base, ref local, .. }
            if base == "s1:5" && local == "s1:0"));

        let concurrent = v5.increment("s2");
        let err = engine
            .apply_patch_message(&json!({"a": 1}), &concurrent, &message)
            .unwrap_err();
        assert_eq!(err.code(), "VERSION_MISMATCH");

        let applied = engine.apply_patch_message(&json!({"a": 1}), &v5, &message).unwrap();
        assert_eq!(applied.state, json!({"a": 2}));
    }

    #[test]
    fn test_compression_disabled() {
        let engine = DeltaSyncEngine::with_config(SyncEngineConfigBuilder::new().compress(false).build());
        let items: Vec<_> = (0..100).map(|i| json!(i)).collect();
        let v = VectorClock::new();
        let message = engine
            .create_patch_message(&json!([]), &json!(items), &v, &v.increment("s"))
            .unwrap();
        assert!(!message.compressed);
        assert_eq!(message.inline_patches().map(|p| p.len()), Some(100));
    }

    #[test]
    fn test_merge_patch_sets_reoptimizes() {
        let engine = DeltaSyncEngine::new();
        let local = vec![JsonPatch::replace("/a", json!(1)), JsonPatch::replace("/b", json!(1))];
        let incoming = vec![JsonPatch::replace("/b", json!(2)), JsonPatch::replace("/c", json!(3))];
        let outcome = engine.merge_patch_sets(&local, &incoming);
        assert!(outcome.is_clean());
        assert_eq!(outcome.conflicts.len(), 1);
        let state = engine
            .apply_patches(&json!({"a": 0, "b": 0, "c": 0}), &outcome.patches)
            .state;
        assert_eq!(state, json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn test_handle_sync_request() {
        let engine = DeltaSyncEngine::new();
        let v0 = VectorClock::for_writer("s1");
        let v1 = v0.increment("s1");
        let v2 = v1.increment("s1");
        engine.create_patch_message(&json!({"n": 0}), &json!({"n": 1}), &v0, &v1).unwrap();
        engine.create_patch_message(&json!({"n": 1}), &json!({"n": 2}), &v1, &v2).unwrap();

        let request = engine.create_sync_request(&v1, None);
        match engine.handle_sync_request(&request) {
            SyncMessage::Response { messages, server_version } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].target_version, v2);
                assert_eq!(server_version, v2);
                let patches = engine.unpack(&messages[0]).unwrap();
                assert_eq!(patches[0].op, PatchOp::Replace);
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let ack = engine.create_sync_ack("m", &v2);
        assert!(matches!(
            engine.handle_sync_request(&ack),
            SyncMessage::Error { ref code, .. } if code == "UNEXPECTED_MESSAGE"
        ));
    }
}

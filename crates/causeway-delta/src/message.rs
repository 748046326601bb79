//! Wire messages of the delta protocol.

use crate::patch::JsonPatch;
use causeway_core::{Checksum, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Patch list as carried on the wire: inline, or a base64 zlib blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatchPayload {
    Patches(Vec<JsonPatch>),
    Compressed(String),
}

/// Versioned, checksummed transport unit for one state transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchMessage {
    pub id: String,
    pub base_version: VectorClock,
    pub target_version: VectorClock,
    pub patches: PatchPayload,
    /// SHA-256 of the canonical patch list, before compression.
    pub checksum: Checksum,
    pub compressed: bool,
    pub timestamp: i64,
}

impl PatchMessage {
    /// Inline patches, `None` while compressed.
    pub fn inline_patches(&self) -> Option<&[JsonPatch]> {
        match &self.patches {
            PatchPayload::Patches(patches) => Some(patches),
            PatchPayload::Compressed(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Request/response protocol spoken between a client and a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncMessage {
    /// "Send me everything after `client_version`."
    #[serde(rename_all = "camelCase")]
    Request {
        client_version: VectorClock,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        messages: Vec<PatchMessage>,
        server_version: VectorClock,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        message_id: String,
        version: VectorClock,
    },
    Error { code: String, message: String },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Request { .. } => "request",
            SyncMessage::Response { .. } => "response",
            SyncMessage::Ack { .. } => "ack",
            SyncMessage::Error { .. } => "error",
        }
    }
}

/// Bounded log of sent patch messages, oldest first.
#[derive(Clone, Debug)]
pub struct MessageLog {
    capacity: usize,
    messages: VecDeque<PatchMessage>,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        MessageLog {
            capacity: capacity.max(1),
            messages: VecDeque::new(),
        }
    }

    /// Append a message, evicting the oldest once full.
    pub fn push(&mut self, message: PatchMessage) {
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Messages a client at `version` has not seen yet, in send order.
    pub fn messages_since(&self, version: &VectorClock) -> Vec<PatchMessage> {
        self.messages
            .iter()
            .filter(|m| !m.target_version.is_before_or_equal(version))
            .cloned()
            .collect()
    }

    /// Merge of every logged target version.
    pub fn latest_version(&self) -> VectorClock {
        self.messages
            .iter()
            .fold(VectorClock::new(), |acc, m| acc.merge(&m.target_version))
    }

    pub fn get(&self, id: &str) -> Option<&PatchMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        MessageLog::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: &str, base: &VectorClock, target: &VectorClock) -> PatchMessage {
        let patches = vec![JsonPatch::replace("/v", json!(id))];
        PatchMessage {
            id: id.to_string(),
            base_version: base.clone(),
            target_version: target.clone(),
            checksum: Checksum::of(&patches).unwrap(),
            patches: PatchPayload::Patches(patches),
            compressed: false,
            timestamp: 0,
        }
    }

    #[test]
    fn test_wire_field_names() {
        let v0 = VectorClock::for_writer("s");
        let v1 = v0.increment("s");
        let json = serde_json::to_value(message("m1", &v0, &v1)).unwrap();
        assert_eq!(json["baseVersion"], json!({"s": 0}));
        assert_eq!(json["targetVersion"], json!({"s": 1}));
        assert_eq!(json["patches"][0]["op"], "replace");
        assert_eq!(json["compressed"], false);
        assert!(json["checksum"].as_str().unwrap().len() == 64);
    }

    #[test]
    fn test_compressed_payload_is_a_string() {
        let parsed: PatchPayload = serde_json::from_value(json!("eJzLSM3JyQcABiwCFQ==")).unwrap();
        assert!(matches!(parsed, PatchPayload::Compressed(_)));
        let parsed: PatchPayload = serde_json::from_value(json!([])).unwrap();
        assert_eq!(parsed, PatchPayload::Patches(vec![]));
    }

    #[test]
    fn test_sync_message_tagging() {
        let request = SyncMessage::Request {
            client_version: VectorClock::from_entries([("c1".to_string(), 2)]),
            state_id: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, json!({"type": "request", "clientVersion": {"c1": 2}}));
        let back: SyncMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
        assert_eq!(back.kind(), "request");
    }

    #[test]
    fn test_messages_since() {
        let v0 = VectorClock::for_writer("s");
        let v1 = v0.increment("s");
        let v2 = v1.increment("s");
        let v3 = v2.increment("s");

        let mut log = MessageLog::new(8);
        log.push(message("m1", &v0, &v1));
        log.push(message("m2", &v1, &v2));
        log.push(message("m3", &v2, &v3));

        let ids: Vec<_> = log.messages_since(&v1).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert!(log.messages_since(&v3).is_empty());
        assert_eq!(log.messages_since(&VectorClock::new()).len(), 3);
        assert_eq!(log.latest_version(), v3);
    }

    #[test]
    fn test_log_is_bounded() {
        let v0 = VectorClock::new();
        let mut log = MessageLog::new(2);
        for i in 0..5 {
            let target = VectorClock::from_entries([("s".to_string(), i + 1)]);
            log.push(message(&format!("m{i}"), &v0, &target));
        }
        assert_eq!(log.len(), 2);
        assert!(log.get("m0").is_none());
        assert!(log.get("m4").is_some());
    }
}

//! Wire envelopes carried on `room:{id}` and `server:{id}` channels.
//!
//! ```json
//! {"type":"broadcast","roomId":"r1","payload":{...},"timestamp":1700000000000,"sourceServerId":"s1"}
//! {"type":"direct","targetConnectionId":"c9","payload":{...},"timestamp":...,"sourceServerId":"s1"}
//! {"type":"server-control","payload":{"command":"ping"},"timestamp":...,"sourceServerId":"s1"}
//! ```

use crate::error::{FabricError, Result};
use causeway_core::now_millis;
use causeway_delta::{PatchMessage, SyncMessage};
use causeway_state::VersionedState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a connection receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum FabricPayload {
    Patch(PatchMessage),
    Sync(SyncMessage),
    State(VersionedState),
    /// Application event for the transport layer.
    Event { name: String, data: Value },
}

impl FabricPayload {
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        FabricPayload::Event {
            name: name.into(),
            data,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FabricPayload::Patch(_) => "patch",
            FabricPayload::Sync(_) => "sync",
            FabricPayload::State(_) => "state",
            FabricPayload::Event { .. } => "event",
        }
    }
}

/// Commands one server sends another over its private channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ControlCommand {
    /// Detach a connection owned by the receiver.
    #[serde(rename_all = "camelCase")]
    DisconnectConnection { connection_id: String },
    /// Ask the receiver to refresh its heartbeat now.
    Ping,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Route {
    #[serde(rename_all = "camelCase")]
    Broadcast {
        room_id: String,
        payload: FabricPayload,
    },
    #[serde(rename_all = "camelCase")]
    Direct {
        target_connection_id: String,
        payload: FabricPayload,
    },
    ServerControl { payload: ControlCommand },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub route: Route,
    pub timestamp: i64,
    pub source_server_id: String,
}

impl Envelope {
    fn new(route: Route, source_server_id: &str) -> Self {
        Envelope {
            route,
            timestamp: now_millis(),
            source_server_id: source_server_id.to_string(),
        }
    }

    pub fn broadcast(room_id: &str, payload: FabricPayload, source_server_id: &str) -> Self {
        Self::new(
            Route::Broadcast {
                room_id: room_id.to_string(),
                payload,
            },
            source_server_id,
        )
    }

    pub fn direct(connection_id: &str, payload: FabricPayload, source_server_id: &str) -> Self {
        Self::new(
            Route::Direct {
                target_connection_id: connection_id.to_string(),
                payload,
            },
            source_server_id,
        )
    }

    pub fn control(command: ControlCommand, source_server_id: &str) -> Self {
        Self::new(Route::ServerControl { payload: command }, source_server_id)
    }

    /// Envelopes a server published itself must be ignored on receipt.
    pub fn is_from(&self, server_id: &str) -> bool {
        self.source_server_id == server_id
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| FabricError::InvalidEnvelope(e.to_string()))
    }
}

//! Shared registry layout: key names and the records stored under them.
//!
//! ```text
//! connections:{id}          hash  userId, serverId, timestamp, rooms
//! servers:{id}              hash  host, port, lastHeartbeat, activeConnections
//! servers:{id}:connections  set   connection ids owned by the server
//! servers:index             set   every registered server id
//! rooms:{id}                set   member connection ids
//! room:{id}                 channel for room broadcasts
//! server:{id}               channel for direct and control messages
//! ```

use std::collections::{BTreeSet, HashMap};

pub const SERVERS_INDEX: &str = "servers:index";

pub fn connection_key(connection_id: &str) -> String {
    format!("connections:{}", connection_id)
}

pub fn server_key(server_id: &str) -> String {
    format!("servers:{}", server_id)
}

pub fn server_connections_key(server_id: &str) -> String {
    format!("servers:{}:connections", server_id)
}

pub fn room_key(room_id: &str) -> String {
    format!("rooms:{}", room_id)
}

pub fn room_channel(room_id: &str) -> String {
    format!("room:{}", room_id)
}

pub fn server_channel(server_id: &str) -> String {
    format!("server:{}", server_id)
}

/// The room id of a `room:{id}` channel.
pub fn room_of_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix("room:")
}

/// A connection as recorded in the shared registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub connection_id: String,
    pub user_id: String,
    pub server_id: String,
    /// Last activity, milliseconds since the epoch.
    pub timestamp: i64,
    pub rooms: BTreeSet<String>,
}

impl ConnectionMetadata {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let rooms = serde_json::to_string(&self.rooms).unwrap_or_else(|_| "[]".to_string());
        vec![
            ("userId".to_string(), self.user_id.clone()),
            ("serverId".to_string(), self.server_id.clone()),
            ("timestamp".to_string(), self.timestamp.to_string()),
            ("rooms".to_string(), rooms),
        ]
    }

    /// Parse a stored hash. Returns `None` for an absent or partial record,
    /// which callers treat as expired.
    pub fn from_fields(connection_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let rooms = fields
            .get("rooms")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        Some(ConnectionMetadata {
            connection_id: connection_id.to_string(),
            user_id: fields.get("userId")?.clone(),
            server_id: fields.get("serverId")?.clone(),
            timestamp: fields.get("timestamp")?.parse().ok()?,
            rooms,
        })
    }

    pub fn is_stale(&self, now: i64, threshold_ms: u64) -> bool {
        now.saturating_sub(self.timestamp) > i64::try_from(threshold_ms).unwrap_or(i64::MAX)
    }
}

/// A server process as recorded in the shared registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub last_heartbeat: i64,
    pub active_connections: usize,
}

impl ServerInfo {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("host".to_string(), self.host.clone()),
            ("port".to_string(), self.port.to_string()),
            ("lastHeartbeat".to_string(), self.last_heartbeat.to_string()),
            (
                "activeConnections".to_string(),
                self.active_connections.to_string(),
            ),
        ]
    }

    pub fn from_fields(server_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        Some(ServerInfo {
            server_id: server_id.to_string(),
            host: fields.get("host")?.clone(),
            port: fields.get("port")?.parse().ok()?,
            last_heartbeat: fields.get("lastHeartbeat")?.parse().ok()?,
            active_connections: fields
                .get("activeConnections")
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
        })
    }

    /// Whether the last heartbeat is within `ttl_ms` of `now`.
    pub fn is_alive(&self, now: i64, ttl_ms: u64) -> bool {
        now.saturating_sub(self.last_heartbeat) <= i64::try_from(ttl_ms).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_record_round_trips_through_fields() {
        let meta = ConnectionMetadata {
            connection_id: "c1".to_string(),
            user_id: "u1".to_string(),
            server_id: "s1".to_string(),
            timestamp: 1_700_000_000_000,
            rooms: ["lobby".to_string(), "r2".to_string()].into_iter().collect(),
        };
        let fields: HashMap<String, String> = meta.to_fields().into_iter().collect();
        assert_eq!(fields["rooms"], r#"["lobby","r2"]"#);
        assert_eq!(ConnectionMetadata::from_fields("c1", &fields), Some(meta));
    }

    #[test]
    fn test_partial_records_read_as_absent() {
        let mut fields = HashMap::new();
        fields.insert("userId".to_string(), "u1".to_string());
        assert_eq!(ConnectionMetadata::from_fields("c1", &fields), None);
        assert_eq!(ServerInfo::from_fields("s1", &HashMap::new()), None);
    }

    #[test]
    fn test_liveness_and_staleness() {
        let server = ServerInfo {
            server_id: "s1".to_string(),
            host: "localhost".to_string(),
            port: 4000,
            last_heartbeat: 1_000,
            active_connections: 0,
        };
        assert!(server.is_alive(1_500, 500));
        assert!(!server.is_alive(1_501, 500));

        let conn = ConnectionMetadata {
            connection_id: "c".to_string(),
            user_id: "u".to_string(),
            server_id: "s1".to_string(),
            timestamp: 1_000,
            rooms: BTreeSet::new(),
        };
        assert!(!conn.is_stale(2_000, 1_000));
        assert!(conn.is_stale(2_001, 1_000));
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(room_channel("r1"), "room:r1");
        assert_eq!(room_of_channel("room:r1"), Some("r1"));
        assert_eq!(room_of_channel("server:s1"), None);
        assert_eq!(server_connections_key("s1"), "servers:s1:connections");
    }
}

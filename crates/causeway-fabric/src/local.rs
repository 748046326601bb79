//! Process-local delivery, supplied by the transport layer.

use crate::envelope::FabricPayload;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Hands payloads to connections attached to this process.
#[async_trait]
pub trait LocalRegistry: Send + Sync + 'static {
    /// Deliver to a locally attached connection. Returns `false` if the
    /// transport no longer knows the connection.
    async fn deliver(&self, connection_id: &str, payload: &FabricPayload) -> bool;

    /// Close the transport side of a connection.
    async fn disconnect(&self, connection_id: &str);
}

/// In-memory registry that records deliveries, for tests and simulations.
#[derive(Clone, Default)]
pub struct MemoryLocalRegistry {
    inboxes: Arc<RwLock<HashMap<String, Vec<FabricPayload>>>>,
    disconnected: Arc<RwLock<Vec<String>>>,
    notify: Arc<Notify>,
}

impl MemoryLocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered to `connection_id` so far.
    pub fn received(&self, connection_id: &str) -> Vec<FabricPayload> {
        self.inboxes
            .read()
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected.read().clone()
    }

    /// Wait until `connection_id` has received at least `count` payloads.
    pub async fn wait_for(&self, connection_id: &str, count: usize) -> Vec<FabricPayload> {
        loop {
            let notified = self.notify.notified();
            let received = self.received(connection_id);
            if received.len() >= count {
                return received;
            }
            notified.await;
        }
    }

    /// Wait until `connection_id` has been disconnected.
    pub async fn wait_for_disconnect(&self, connection_id: &str) {
        loop {
            let notified = self.notify.notified();
            if self.disconnected.read().iter().any(|c| c == connection_id) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl LocalRegistry for MemoryLocalRegistry {
    async fn deliver(&self, connection_id: &str, payload: &FabricPayload) -> bool {
        self.inboxes
            .write()
            .entry(connection_id.to_string())
            .or_default()
            .push(payload.clone());
        self.notify.notify_waiters();
        true
    }

    async fn disconnect(&self, connection_id: &str) {
        self.disconnected.write().push(connection_id.to_string());
        self.notify.notify_waiters();
    }
}

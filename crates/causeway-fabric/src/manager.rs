//! Distributed connection manager.
//!
//! Each process owns one manager. It records its connections and their
//! room memberships in the shared store, subscribes to the channels of
//! rooms it hosts members of, and delivers only to its local connections.
//! Cross-process fan-out happens entirely through store pub/sub.
//!
//! Background tasks started by [`DistributedConnectionManager::start`]:
//! - heartbeat: refreshes this server's liveness and its connections' TTLs
//! - cleanup: purges connections idle longer than the staleness threshold
//! - failure detection: purges everything owned by servers whose heartbeat
//!   is older than the liveness TTL
//! - message pump: routes envelopes arriving on subscribed channels

use crate::config::FabricConfig;
use crate::envelope::{ControlCommand, Envelope, FabricPayload, Route};
use crate::error::{FabricError, Result};
use crate::local::LocalRegistry;
use crate::registry::{
    connection_key, room_channel, room_key, server_channel, server_connections_key, server_key,
    ConnectionMetadata, ServerInfo, SERVERS_INDEX,
};
use crate::store::{MessageStream, SharedStore, StoreMessage, Subscriber};
use causeway_core::now_millis;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Where a payload for a single connection went.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered to a connection attached to this process.
    Local,
    /// Published to the owning server's channel.
    Forwarded { server_id: String },
}

/// Cluster-wide view from one server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedStats {
    pub server_id: String,
    pub live_servers: usize,
    pub total_servers: usize,
    pub total_connections: usize,
    pub local_connections: usize,
    pub local_rooms: usize,
    pub subscribed_channels: usize,
}

#[derive(Clone, Debug)]
struct LocalConnection {
    user_id: String,
    rooms: BTreeSet<String>,
    last_active: i64,
}

pub struct DistributedConnectionManager {
    config: FabricConfig,
    store: Arc<dyn SharedStore>,
    registry: Arc<dyn LocalRegistry>,
    subscriber: Box<dyn Subscriber>,
    inbox: Mutex<Option<MessageStream>>,
    local: RwLock<HashMap<String, LocalConnection>>,
    /// room id → local member connection ids
    local_rooms: RwLock<HashMap<String, HashSet<String>>>,
    channels: RwLock<HashSet<String>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl DistributedConnectionManager {
    /// Open a subscription on `store` and listen on this server's private
    /// channel. Nothing is registered until [`start`](Self::start).
    pub async fn new(
        config: FabricConfig,
        store: Arc<dyn SharedStore>,
        registry: Arc<dyn LocalRegistry>,
    ) -> Result<Self> {
        let (subscriber, inbox) = store.subscriber().await?;
        let private = server_channel(&config.server_id);
        subscriber.subscribe(&private).await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(DistributedConnectionManager {
            config,
            store,
            registry,
            subscriber,
            inbox: Mutex::new(Some(inbox)),
            local: RwLock::new(HashMap::new()),
            local_rooms: RwLock::new(HashMap::new()),
            channels: RwLock::new([private].into_iter().collect()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty() && !self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_local(&self, connection_id: &str) -> bool {
        self.local.read().contains_key(connection_id)
    }

    pub fn local_connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.local.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.read().iter().cloned().collect();
        channels.sort();
        channels
    }

    fn ensure_open(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(FabricError::ShutDown)
        } else {
            Ok(())
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Register this server and spawn the background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        let inbox = self.inbox.lock().take().ok_or(FabricError::AlreadyStarted)?;
        self.register_server().await?;

        let heartbeat = self.spawn_periodic(self.config.heartbeat_interval(), |this| async move {
            if let Err(err) = this.heartbeat().await {
                tracing::warn!(server_id = %this.server_id(), error = %err, "heartbeat failed; retrying next tick");
            }
        });
        let cleanup = self.spawn_periodic(self.config.cleanup_interval(), |this| async move {
            if let Err(err) = this.cleanup_stale_connections().await {
                tracing::warn!(server_id = %this.server_id(), error = %err, "cleanup sweep failed; retrying next tick");
            }
        });
        let failures = self.spawn_periodic(self.config.failure_check_interval(), |this| async move {
            if let Err(err) = this.detect_failed_servers().await {
                tracing::warn!(server_id = %this.server_id(), error = %err, "failure sweep failed; retrying next tick");
            }
        });
        let pump = self.spawn_pump(inbox);

        self.tasks.lock().extend([heartbeat, cleanup, failures, pump]);
        tracing::info!(
            server_id = %self.server_id(),
            host = %self.config.host,
            port = self.config.port,
            "fabric started"
        );
        Ok(())
    }

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick is immediate.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => tick(Arc::clone(&this)).await,
                }
            }
        })
    }

    fn spawn_pump(self: &Arc<Self>, mut inbox: MessageStream) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    message = inbox.recv() => match message {
                        Some(message) => this.handle_message(message).await,
                        None => {
                            tracing::warn!(server_id = %this.server_id(), "subscription stream closed");
                            break;
                        }
                    },
                }
            }
        })
    }

    /// Stop every background task, deregister this server and its
    /// connections, and close the store handle. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(server_id = %self.server_id(), error = %err, "background task ended abnormally");
            }
        }

        let mut first_error = None;
        for connection_id in self.local_connections() {
            if let Err(err) = self.purge_connection(&connection_id).await {
                first_error.get_or_insert(err);
            }
            self.registry.disconnect(&connection_id).await;
        }
        let id = self.server_id();
        for step in [
            self.store.del(&server_connections_key(id)).await,
            self.store.del(&server_key(id)).await,
            self.store.srem(SERVERS_INDEX, id).await,
        ] {
            if let Err(err) = step {
                first_error.get_or_insert(err.into());
            }
        }
        for channel in self.subscribed_channels() {
            let _ = self.subscriber.unsubscribe(&channel).await;
        }
        self.channels.write().clear();
        self.store.close().await?;

        tracing::info!(server_id = %id, "fabric shut down");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ---- server liveness -------------------------------------------------

    pub async fn register_server(&self) -> Result<()> {
        self.store.sadd(SERVERS_INDEX, self.server_id()).await?;
        self.heartbeat().await
    }

    /// Refresh this server's record and the TTL of its connections.
    pub async fn heartbeat(&self) -> Result<()> {
        self.ensure_open()?;
        let info = ServerInfo {
            server_id: self.server_id().to_string(),
            host: self.config.host.clone(),
            port: self.config.port,
            last_heartbeat: now_millis(),
            active_connections: self.local.read().len(),
        };
        let key = server_key(self.server_id());
        self.store.hset(&key, &info.to_fields()).await?;
        self.store.expire(&key, self.config.server_ttl_ms()).await?;

        for connection_id in self.local_connections() {
            if let Err(err) = self
                .store
                .expire(&connection_key(&connection_id), self.config.connection_ttl_ms)
                .await
            {
                tracing::warn!(
                    server_id = %self.server_id(),
                    connection_id = %connection_id,
                    error = %err,
                    "failed to refresh connection ttl"
                );
            }
        }
        tracing::trace!(server_id = %self.server_id(), connections = info.active_connections, "heartbeat");
        Ok(())
    }

    /// Purge every server whose heartbeat is older than the liveness TTL,
    /// along with its connections and memberships. Returns the purged ids.
    pub async fn detect_failed_servers(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let now = now_millis();
        let mut failed = Vec::new();
        for server_id in self.store.smembers(SERVERS_INDEX).await? {
            if server_id == self.server_id() {
                continue;
            }
            let fields = self.store.hgetall(&server_key(&server_id)).await?;
            let alive = ServerInfo::from_fields(&server_id, &fields)
                .is_some_and(|info| info.is_alive(now, self.config.heartbeat_ttl_ms));
            if alive {
                continue;
            }

            let owned = self.store.smembers(&server_connections_key(&server_id)).await?;
            for connection_id in &owned {
                self.purge_connection(connection_id).await?;
            }
            self.store.del(&server_connections_key(&server_id)).await?;
            self.store.del(&server_key(&server_id)).await?;
            self.store.srem(SERVERS_INDEX, &server_id).await?;
            tracing::warn!(
                server_id = %self.server_id(),
                failed_server = %server_id,
                connections = owned.len(),
                "purged failed server"
            );
            failed.push(server_id);
        }
        Ok(failed)
    }

    // ---- connections -----------------------------------------------------

    /// Record a connection attached to this process. Store failures are
    /// returned to the caller and nothing is recorded locally.
    pub async fn register_connection(
        &self,
        connection_id: &str,
        user_id: &str,
    ) -> Result<ConnectionMetadata> {
        self.ensure_open()?;
        if self.is_local(connection_id) {
            return Err(FabricError::DuplicateConnection(connection_id.to_string()));
        }
        let meta = ConnectionMetadata {
            connection_id: connection_id.to_string(),
            user_id: user_id.to_string(),
            server_id: self.server_id().to_string(),
            timestamp: now_millis(),
            rooms: BTreeSet::new(),
        };
        let key = connection_key(connection_id);
        self.store.hset(&key, &meta.to_fields()).await?;
        self.store.expire(&key, self.config.connection_ttl_ms).await?;
        self.store
            .sadd(&server_connections_key(self.server_id()), connection_id)
            .await?;

        self.local.write().insert(
            connection_id.to_string(),
            LocalConnection {
                user_id: user_id.to_string(),
                rooms: BTreeSet::new(),
                last_active: meta.timestamp,
            },
        );
        tracing::debug!(server_id = %self.server_id(), connection_id, user_id, "registered connection");
        Ok(meta)
    }

    /// Remove a connection and all of its memberships from the registry.
    pub async fn remove_connection(&self, connection_id: &str) -> Result<()> {
        self.ensure_open()?;
        let known = self.is_local(connection_id)
            || self.store.exists(&connection_key(connection_id)).await?;
        if !known {
            return Err(FabricError::ConnectionNotFound(connection_id.to_string()));
        }
        self.purge_connection(connection_id).await?;
        tracing::debug!(server_id = %self.server_id(), connection_id, "removed connection");
        Ok(())
    }

    /// Delete a connection's registry entries and drop local state. Safe to
    /// run for connections that are already partly gone.
    async fn purge_connection(&self, connection_id: &str) -> Result<()> {
        let key = connection_key(connection_id);
        let stored = ConnectionMetadata::from_fields(connection_id, &self.store.hgetall(&key).await?);
        let local = self.local.write().remove(connection_id);

        let mut rooms: BTreeSet<String> = BTreeSet::new();
        let mut owners: BTreeSet<String> = BTreeSet::new();
        if let Some(meta) = &stored {
            rooms.extend(meta.rooms.iter().cloned());
            owners.insert(meta.server_id.clone());
        }
        if let Some(conn) = &local {
            rooms.extend(conn.rooms.iter().cloned());
            owners.insert(self.server_id().to_string());
            let mut local_rooms = self.local_rooms.write();
            for room in &conn.rooms {
                if let Some(members) = local_rooms.get_mut(room) {
                    members.remove(connection_id);
                    if members.is_empty() {
                        local_rooms.remove(room);
                    }
                }
            }
        }

        for room in &rooms {
            self.store.srem(&room_key(room), connection_id).await?;
        }
        self.store.del(&key).await?;
        for owner in &owners {
            self.store
                .srem(&server_connections_key(owner), connection_id)
                .await?;
        }
        Ok(())
    }

    /// Mark a local connection as active.
    pub async fn touch_connection(&self, connection_id: &str) -> Result<()> {
        self.ensure_open()?;
        let meta = self.local_metadata(connection_id, now_millis())?;
        let key = connection_key(connection_id);
        self.store.hset(&key, &meta.to_fields()).await?;
        self.store.expire(&key, self.config.connection_ttl_ms).await?;
        Ok(())
    }

    /// Refresh the local record's timestamp and return it as metadata.
    fn local_metadata(&self, connection_id: &str, now: i64) -> Result<ConnectionMetadata> {
        let mut local = self.local.write();
        let conn = local
            .get_mut(connection_id)
            .ok_or_else(|| FabricError::ConnectionNotFound(connection_id.to_string()))?;
        conn.last_active = now;
        Ok(ConnectionMetadata {
            connection_id: connection_id.to_string(),
            user_id: conn.user_id.clone(),
            server_id: self.server_id().to_string(),
            timestamp: now,
            rooms: conn.rooms.clone(),
        })
    }

    pub async fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionMetadata>> {
        let fields = self.store.hgetall(&connection_key(connection_id)).await?;
        Ok(ConnectionMetadata::from_fields(connection_id, &fields))
    }

    /// Purge connections idle longer than the staleness threshold. Local
    /// ones are detached here; owners of remote ones are told to detach.
    pub async fn cleanup_stale_connections(&self) -> Result<usize> {
        self.ensure_open()?;
        let now = now_millis();
        let mut removed = 0;
        for server_id in self.store.smembers(SERVERS_INDEX).await? {
            for connection_id in self.store.smembers(&server_connections_key(&server_id)).await? {
                let stale = match self.get_connection(&connection_id).await? {
                    Some(meta) => meta.is_stale(now, self.config.stale_connection_ms),
                    None => !self.is_local(&connection_id),
                };
                if !stale {
                    continue;
                }
                let was_local = self.is_local(&connection_id);
                self.purge_connection(&connection_id).await?;
                if was_local {
                    self.registry.disconnect(&connection_id).await;
                } else if server_id != self.server_id() {
                    let command = ControlCommand::DisconnectConnection {
                        connection_id: connection_id.clone(),
                    };
                    self.publish(&server_channel(&server_id), &Envelope::control(command, self.server_id()))
                        .await?;
                }
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(server_id = %self.server_id(), removed, "swept stale connections");
        }
        Ok(removed)
    }

    // ---- rooms -----------------------------------------------------------

    /// Add a local connection to a room, subscribing this server to the
    /// room's channel on first use. Local membership changes only after the
    /// store accepted the join.
    pub async fn join_room(&self, connection_id: &str, room_id: &str) -> Result<()> {
        self.ensure_open()?;
        let now = now_millis();
        let meta = self.membership_record(connection_id, now, |rooms| {
            rooms.insert(room_id.to_string());
        })?;

        self.store.sadd(&room_key(room_id), connection_id).await?;
        self.store
            .hset(&connection_key(connection_id), &meta.to_fields())
            .await?;

        let channel = room_channel(room_id);
        let subscribe = !self.channels.read().contains(&channel);
        if subscribe {
            self.subscriber.subscribe(&channel).await?;
            self.channels.write().insert(channel);
        }

        if let Some(conn) = self.local.write().get_mut(connection_id) {
            conn.rooms.insert(room_id.to_string());
            conn.last_active = now;
        }
        self.local_rooms
            .write()
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        tracing::debug!(server_id = %self.server_id(), connection_id, room = %room_id, "joined room");
        Ok(())
    }

    /// Remove a local connection from a room. The channel subscription is
    /// kept for reuse. Local delivery stops only after the store accepted
    /// the leave.
    pub async fn leave_room(&self, connection_id: &str, room_id: &str) -> Result<()> {
        self.ensure_open()?;
        let meta = self.membership_record(connection_id, now_millis(), |rooms| {
            rooms.remove(room_id);
        })?;

        self.store.srem(&room_key(room_id), connection_id).await?;
        self.store
            .hset(&connection_key(connection_id), &meta.to_fields())
            .await?;

        if let Some(conn) = self.local.write().get_mut(connection_id) {
            conn.rooms.remove(room_id);
        }
        {
            let mut local_rooms = self.local_rooms.write();
            if let Some(members) = local_rooms.get_mut(room_id) {
                members.remove(connection_id);
                if members.is_empty() {
                    local_rooms.remove(room_id);
                }
            }
        }
        tracing::debug!(server_id = %self.server_id(), connection_id, room = %room_id, "left room");
        Ok(())
    }

    /// The stored record of a local connection after `edit` is applied to a
    /// copy of its room set.
    fn membership_record(
        &self,
        connection_id: &str,
        timestamp: i64,
        edit: impl FnOnce(&mut BTreeSet<String>),
    ) -> Result<ConnectionMetadata> {
        let local = self.local.read();
        let conn = local
            .get(connection_id)
            .ok_or_else(|| FabricError::ConnectionNotFound(connection_id.to_string()))?;
        let mut rooms = conn.rooms.clone();
        edit(&mut rooms);
        Ok(ConnectionMetadata {
            connection_id: connection_id.to_string(),
            user_id: conn.user_id.clone(),
            server_id: self.server_id().to_string(),
            timestamp,
            rooms,
        })
    }

    /// Members of a room across all servers.
    pub async fn room_members(&self, room_id: &str) -> Result<Vec<String>> {
        Ok(self.store.smembers(&room_key(room_id)).await?)
    }

    // ---- routing ---------------------------------------------------------

    /// Deliver to this server's members of the room and publish once to the
    /// room channel for every other server. Returns the local delivery count.
    pub async fn broadcast_to_room(&self, room_id: &str, payload: FabricPayload) -> Result<usize> {
        self.ensure_open()?;
        let delivered = self.deliver_to_room(room_id, &payload).await;
        let envelope = Envelope::broadcast(room_id, payload, self.server_id());
        self.publish(&room_channel(room_id), &envelope).await?;
        Ok(delivered)
    }

    /// Deliver locally if the connection is attached here, otherwise
    /// forward to its owner.
    pub async fn send_to_connection(
        &self,
        connection_id: &str,
        payload: FabricPayload,
    ) -> Result<Delivery> {
        self.ensure_open()?;
        if self.is_local(connection_id) {
            self.deliver(connection_id, &payload).await;
            return Ok(Delivery::Local);
        }
        let meta = self
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| FabricError::ConnectionNotFound(connection_id.to_string()))?;
        let envelope = Envelope::direct(connection_id, payload, self.server_id());
        self.publish(&server_channel(&meta.server_id), &envelope).await?;
        Ok(Delivery::Forwarded {
            server_id: meta.server_id,
        })
    }

    /// Detach a connection wherever it lives.
    pub async fn disconnect_remote(&self, connection_id: &str) -> Result<Delivery> {
        self.ensure_open()?;
        if self.is_local(connection_id) {
            self.detach_local(connection_id).await?;
            return Ok(Delivery::Local);
        }
        let meta = self
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| FabricError::ConnectionNotFound(connection_id.to_string()))?;
        let command = ControlCommand::DisconnectConnection {
            connection_id: connection_id.to_string(),
        };
        self.publish(&server_channel(&meta.server_id), &Envelope::control(command, self.server_id()))
            .await?;
        Ok(Delivery::Forwarded {
            server_id: meta.server_id,
        })
    }

    /// Ask another server to refresh its heartbeat immediately.
    pub async fn ping_server(&self, server_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.publish(&server_channel(server_id), &Envelope::control(ControlCommand::Ping, self.server_id()))
            .await
    }

    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<()> {
        let raw = envelope.to_json()?;
        let receivers = self.store.publish(channel, &raw).await?;
        tracing::trace!(server_id = %self.server_id(), channel, receivers, "published");
        Ok(())
    }

    async fn deliver(&self, connection_id: &str, payload: &FabricPayload) -> bool {
        let delivered = self.registry.deliver(connection_id, payload).await;
        if !delivered {
            tracing::debug!(server_id = %self.server_id(), connection_id, "transport dropped delivery");
        }
        delivered
    }

    async fn deliver_to_room(&self, room_id: &str, payload: &FabricPayload) -> usize {
        let members: Vec<String> = self
            .local_rooms
            .read()
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        let results =
            futures::future::join_all(members.iter().map(|id| self.deliver(id, payload))).await;
        results.into_iter().filter(|delivered| *delivered).count()
    }

    async fn detach_local(&self, connection_id: &str) -> Result<()> {
        self.purge_connection(connection_id).await?;
        self.registry.disconnect(connection_id).await;
        tracing::debug!(server_id = %self.server_id(), connection_id, "detached connection");
        Ok(())
    }

    /// Route one message from a subscribed channel.
    async fn handle_message(&self, message: StoreMessage) {
        let envelope = match Envelope::from_json(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(server_id = %self.server_id(), channel = %message.channel, error = %err, "dropping malformed envelope");
                return;
            }
        };
        if envelope.is_from(self.server_id()) {
            return;
        }
        match envelope.route {
            Route::Broadcast { room_id, payload } => {
                let delivered = self.deliver_to_room(&room_id, &payload).await;
                tracing::trace!(server_id = %self.server_id(), room = %room_id, delivered, "broadcast received");
            }
            Route::Direct {
                target_connection_id,
                payload,
            } => {
                if self.is_local(&target_connection_id) {
                    self.deliver(&target_connection_id, &payload).await;
                } else {
                    tracing::debug!(
                        server_id = %self.server_id(),
                        connection_id = %target_connection_id,
                        source = %envelope.source_server_id,
                        "direct message for a connection not attached here"
                    );
                }
            }
            Route::ServerControl { payload } => self.handle_control(payload).await,
        }
    }

    async fn handle_control(&self, command: ControlCommand) {
        let result = match command {
            ControlCommand::DisconnectConnection { connection_id } => {
                if self.is_local(&connection_id) {
                    self.detach_local(&connection_id).await
                } else {
                    Ok(())
                }
            }
            ControlCommand::Ping => self.heartbeat().await,
        };
        if let Err(err) = result {
            tracing::warn!(server_id = %self.server_id(), error = %err, "control command failed");
        }
    }

    // ---- stats -----------------------------------------------------------

    pub async fn get_distributed_stats(&self) -> Result<DistributedStats> {
        let now = now_millis();
        let servers = self.store.smembers(SERVERS_INDEX).await?;
        let mut live_servers = 0;
        let mut total_connections = 0;
        for server_id in &servers {
            let fields = self.store.hgetall(&server_key(server_id)).await?;
            if ServerInfo::from_fields(server_id, &fields)
                .is_some_and(|info| info.is_alive(now, self.config.heartbeat_ttl_ms))
            {
                live_servers += 1;
            }
            total_connections += self.store.scard(&server_connections_key(server_id)).await?;
        }
        Ok(DistributedStats {
            server_id: self.server_id().to_string(),
            live_servers,
            total_servers: servers.len(),
            total_connections,
            local_connections: self.local.read().len(),
            local_rooms: self.local_rooms.read().len(),
            subscribed_channels: self.channels.read().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabricConfigBuilder;
    use crate::local::MemoryLocalRegistry;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn manager(store: &MemoryStore, id: &str) -> (DistributedConnectionManager, MemoryLocalRegistry) {
        let registry = MemoryLocalRegistry::new();
        let config = FabricConfigBuilder::new().server_id(id).build();
        let manager = DistributedConnectionManager::new(
            config,
            Arc::new(store.connect()),
            Arc::new(registry.clone()),
        )
        .await
        .unwrap();
        manager.register_server().await.unwrap();
        (manager, registry)
    }

    #[tokio::test]
    async fn test_register_then_remove_leaves_no_residue() {
        let store = MemoryStore::new();
        let (fabric, _) = manager(&store, "s1").await;
        let baseline = store.keys();

        fabric.register_connection("c1", "u1").await.unwrap();
        fabric.join_room("c1", "r1").await.unwrap();
        fabric.join_room("c1", "r2").await.unwrap();
        assert_eq!(fabric.room_members("r1").await.unwrap(), vec!["c1".to_string()]);

        fabric.remove_connection("c1").await.unwrap();
        assert_eq!(store.keys(), baseline);
        assert!(fabric.local_connections().is_empty());
        // Subscriptions are kept for reuse.
        assert!(fabric.subscribed_channels().contains(&"room:r1".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_connections() {
        let store = MemoryStore::new();
        let (fabric, _) = manager(&store, "s1").await;
        fabric.register_connection("c1", "u1").await.unwrap();

        assert!(matches!(
            fabric.register_connection("c1", "u1").await,
            Err(FabricError::DuplicateConnection(_))
        ));
        assert!(matches!(
            fabric.join_room("ghost", "r1").await,
            Err(FabricError::ConnectionNotFound(_))
        ));
        assert!(matches!(
            fabric.remove_connection("ghost").await,
            Err(FabricError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registration_failure_is_propagated() {
        let store = MemoryStore::new();
        let (fabric, _) = manager(&store, "s1").await;
        store.set_available(false);

        let err = fabric.register_connection("c1", "u1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(!fabric.is_local("c1"));
        store.set_available(true);
    }

    #[tokio::test]
    async fn test_last_member_leaving_deletes_room() {
        let store = MemoryStore::new();
        let (fabric, _) = manager(&store, "s1").await;
        fabric.register_connection("c1", "u1").await.unwrap();
        fabric.register_connection("c2", "u2").await.unwrap();
        fabric.join_room("c1", "r1").await.unwrap();
        fabric.join_room("c2", "r1").await.unwrap();

        fabric.leave_room("c1", "r1").await.unwrap();
        assert!(store.exists("rooms:r1").await.unwrap());
        fabric.leave_room("c2", "r1").await.unwrap();
        assert!(!store.exists("rooms:r1").await.unwrap());

        let meta = fabric.get_connection("c2").await.unwrap().unwrap();
        assert!(meta.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_failed_join_leaves_membership_untouched() {
        let store = MemoryStore::new();
        let (fabric, registry) = manager(&store, "s1").await;
        fabric.register_connection("c1", "u1").await.unwrap();

        store.set_available(false);
        assert!(fabric.join_room("c1", "r1").await.is_err());
        store.set_available(true);

        assert!(fabric.room_members("r1").await.unwrap().is_empty());
        assert!(!fabric.subscribed_channels().contains(&"room:r1".to_string()));
        let payload = FabricPayload::event("hello", json!(null));
        assert_eq!(fabric.broadcast_to_room("r1", payload).await.unwrap(), 0);
        assert!(registry.received("c1").is_empty());
        let meta = fabric.get_connection("c1").await.unwrap().unwrap();
        assert!(meta.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_failed_leave_keeps_delivering() {
        let store = MemoryStore::new();
        let (fabric, registry) = manager(&store, "s1").await;
        fabric.register_connection("c1", "u1").await.unwrap();
        fabric.join_room("c1", "r1").await.unwrap();

        store.set_available(false);
        assert!(fabric.leave_room("c1", "r1").await.is_err());
        store.set_available(true);

        assert_eq!(fabric.room_members("r1").await.unwrap(), vec!["c1".to_string()]);
        let payload = FabricPayload::event("hello", json!(null));
        assert_eq!(fabric.broadcast_to_room("r1", payload.clone()).await.unwrap(), 1);
        assert_eq!(registry.received("c1"), vec![payload]);
    }

    /// Store whose `expire` fails for one key once armed.
    struct FailingExpire {
        inner: MemoryStore,
        key: String,
        armed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl SharedStore for FailingExpire {
        async fn hset(&self, key: &str, fields: &[(String, String)]) -> crate::error::StoreResult<()> {
            self.inner.hset(key, fields).await
        }

        async fn hgetall(&self, key: &str) -> crate::error::StoreResult<HashMap<String, String>> {
            self.inner.hgetall(key).await
        }

        async fn expire(&self, key: &str, ttl_ms: u64) -> crate::error::StoreResult<()> {
            if self.armed.load(Ordering::SeqCst) && key == self.key {
                return Err(crate::error::StoreError::Command("expire refused".to_string()));
            }
            self.inner.expire(key, ttl_ms).await
        }

        async fn exists(&self, key: &str) -> crate::error::StoreResult<bool> {
            self.inner.exists(key).await
        }

        async fn del(&self, key: &str) -> crate::error::StoreResult<()> {
            self.inner.del(key).await
        }

        async fn sadd(&self, key: &str, member: &str) -> crate::error::StoreResult<()> {
            self.inner.sadd(key, member).await
        }

        async fn srem(&self, key: &str, member: &str) -> crate::error::StoreResult<()> {
            self.inner.srem(key, member).await
        }

        async fn smembers(&self, key: &str) -> crate::error::StoreResult<Vec<String>> {
            self.inner.smembers(key).await
        }

        async fn scard(&self, key: &str) -> crate::error::StoreResult<usize> {
            self.inner.scard(key).await
        }

        async fn publish(&self, channel: &str, payload: &str) -> crate::error::StoreResult<usize> {
            self.inner.publish(channel, payload).await
        }

        async fn subscriber(
            &self,
        ) -> crate::error::StoreResult<(Box<dyn Subscriber>, MessageStream)> {
            self.inner.subscriber().await
        }

        async fn close(&self) -> crate::error::StoreResult<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_past_a_failed_connection() {
        let store = MemoryStore::new();
        let armed = Arc::new(AtomicBool::new(false));
        let flaky = FailingExpire {
            inner: store.connect(),
            key: "connections:a".to_string(),
            armed: Arc::clone(&armed),
        };
        let config = FabricConfigBuilder::new()
            .server_id("s1")
            .connection_ttl_ms(1_000)
            .build();
        let fabric = DistributedConnectionManager::new(
            config,
            Arc::new(flaky),
            Arc::new(MemoryLocalRegistry::new()),
        )
        .await
        .unwrap();
        fabric.register_server().await.unwrap();
        fabric.register_connection("a", "u1").await.unwrap();
        fabric.register_connection("b", "u2").await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        armed.store(true, Ordering::SeqCst);
        fabric.heartbeat().await.unwrap();

        let stale = store.ttl_ms("connections:a").unwrap();
        let refreshed = store.ttl_ms("connections:b").unwrap();
        assert!(stale < 950, "ttl of a was {stale}");
        assert!(refreshed > 960, "ttl of b was {refreshed}");
    }

    #[tokio::test]
    async fn test_local_broadcast_and_direct_delivery() {
        let store = MemoryStore::new();
        let (fabric, registry) = manager(&store, "s1").await;
        fabric.register_connection("c1", "u1").await.unwrap();
        fabric.register_connection("c2", "u2").await.unwrap();
        fabric.join_room("c1", "r1").await.unwrap();
        fabric.join_room("c2", "r1").await.unwrap();

        let payload = FabricPayload::event("hello", json!({"n": 1}));
        assert_eq!(fabric.broadcast_to_room("r1", payload.clone()).await.unwrap(), 2);
        assert_eq!(registry.received("c1"), vec![payload.clone()]);
        assert_eq!(registry.received("c2"), vec![payload.clone()]);

        assert_eq!(
            fabric.send_to_connection("c1", payload).await.unwrap(),
            Delivery::Local
        );
        assert_eq!(registry.received("c1").len(), 2);
    }

    #[tokio::test]
    async fn test_stale_connections_are_swept() {
        let store = MemoryStore::new();
        let registry = MemoryLocalRegistry::new();
        let config = FabricConfigBuilder::new()
            .server_id("s1")
            .stale_connection_ms(20)
            .build();
        let fabric = DistributedConnectionManager::new(
            config,
            Arc::new(store.connect()),
            Arc::new(registry.clone()),
        )
        .await
        .unwrap();
        fabric.register_server().await.unwrap();
        fabric.register_connection("idle", "u1").await.unwrap();
        fabric.register_connection("busy", "u2").await.unwrap();
        fabric.join_room("idle", "r1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        fabric.touch_connection("busy").await.unwrap();

        assert_eq!(fabric.cleanup_stale_connections().await.unwrap(), 1);
        assert_eq!(fabric.local_connections(), vec!["busy".to_string()]);
        assert_eq!(registry.disconnected(), vec!["idle".to_string()]);
        assert!(!store.exists("rooms:r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = MemoryStore::new();
        let (s1, _) = manager(&store, "s1").await;
        let (s2, _) = manager(&store, "s2").await;
        s1.register_connection("a", "u1").await.unwrap();
        s2.register_connection("b", "u2").await.unwrap();
        s2.register_connection("c", "u3").await.unwrap();
        s1.join_room("a", "r1").await.unwrap();

        let stats = s1.get_distributed_stats().await.unwrap();
        assert_eq!(stats.server_id, "s1");
        assert_eq!(stats.total_servers, 2);
        assert_eq!(stats.live_servers, 2);
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.local_connections, 1);
        assert_eq!(stats.local_rooms, 1);
        assert_eq!(stats.subscribed_channels, 2);
    }

    #[tokio::test]
    async fn test_shutdown_deregisters() {
        let store = MemoryStore::new();
        let (fabric, registry) = manager(&store, "s1").await;
        fabric.register_connection("c1", "u1").await.unwrap();
        fabric.join_room("c1", "r1").await.unwrap();

        fabric.shutdown().await.unwrap();
        assert!(store.keys().is_empty());
        assert_eq!(registry.disconnected(), vec!["c1".to_string()]);
        assert!(matches!(
            fabric.register_connection("c2", "u2").await,
            Err(FabricError::ShutDown)
        ));
        // Second call is a no-op.
        fabric.shutdown().await.unwrap();
    }
}

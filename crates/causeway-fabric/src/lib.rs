//! # causeway-fabric
//!
//! Routes payloads between connections that may be attached to different
//! server processes. A shared key-value/pub-sub store records which server
//! owns each connection and which rooms it belongs to; every process
//! delivers only to its own connections.
//!
//! ```text
//!  server 1                    shared store                   server 2
//! ┌─────────┐  publish room:R  ┌───────────┐  room:R message  ┌─────────┐
//! │ conn A  │ ───────────────▶ │ rooms:R   │ ───────────────▶ │ conn B  │
//! └─────────┘                  │ conns:*   │                  └─────────┘
//!                              │ servers:* │
//!                              └───────────┘
//! ```
//!
//! - [`DistributedConnectionManager`]: registry operations, routing,
//!   heartbeat, stale and failed-server sweeps
//! - [`SharedStore`]: store seam, with [`MemoryStore`] in process and
//!   `RedisStore` behind the `redis` feature
//! - [`LocalRegistry`]: delivery to locally attached connections
//! - [`Envelope`]: wire format on room and server channels
//!
//! ## Example
//!
//! ```rust
//! use causeway_fabric::{
//!     DistributedConnectionManager, FabricConfigBuilder, FabricPayload, MemoryLocalRegistry,
//!     MemoryStore,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store = MemoryStore::new();
//! let registry = MemoryLocalRegistry::new();
//! let config = FabricConfigBuilder::new().server_id("s1").build();
//! let fabric = DistributedConnectionManager::new(config, Arc::new(store), Arc::new(registry.clone()))
//!     .await
//!     .unwrap();
//!
//! fabric.register_connection("c1", "alice").await.unwrap();
//! fabric.join_room("c1", "lobby").await.unwrap();
//! fabric
//!     .broadcast_to_room("lobby", FabricPayload::event("hello", json!({})))
//!     .await
//!     .unwrap();
//! assert_eq!(registry.received("c1").len(), 1);
//! # });
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod local;
pub mod manager;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod registry;
pub mod store;

pub use config::{FabricConfig, FabricConfigBuilder};
pub use envelope::{ControlCommand, Envelope, FabricPayload, Route};
pub use error::{FabricError, Result, StoreError, StoreResult};
pub use local::{LocalRegistry, MemoryLocalRegistry};
pub use manager::{Delivery, DistributedConnectionManager, DistributedStats};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use registry::{ConnectionMetadata, ServerInfo};
pub use store::{MemoryStore, MessageStream, SharedStore, StoreMessage, Subscriber};

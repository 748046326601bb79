//! Shared key-value and publish/subscribe store abstraction.
//!
//! The fabric needs only a narrow slice of a Redis-like store: hashes,
//! sets, per-key TTLs and channels. [`MemoryStore`] implements it in
//! process, so several fabric instances can share one store in tests and
//! simulations; `RedisStore` (feature `redis`) implements it over a real
//! server.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use causeway_core::now_millis;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message received on a subscribed channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Incoming messages for every channel a [`Subscriber`] is subscribed to.
pub type MessageStream = mpsc::UnboundedReceiver<StoreMessage>;

/// Controls the channel set of one subscription.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, channel: &str) -> StoreResult<()>;

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()>;
}

/// Shared store used as the single source of truth for ownership and
/// membership. Every command is individually atomic; nothing else is.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Set fields on a hash, creating it if needed. Existing TTLs are kept.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    /// All fields of a hash; empty if the key is absent or expired.
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Expire `key` after `ttl_ms`. No-op for absent keys.
    async fn expire(&self, key: &str, ttl_ms: u64) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Remove a member; a set left empty is deleted.
    async fn srem(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn scard(&self, key: &str) -> StoreResult<usize>;

    /// Publish to a channel, returning the number of receiving subscribers.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize>;

    /// Open a subscription with its own channel set and message stream.
    async fn subscriber(&self) -> StoreResult<(Box<dyn Subscriber>, MessageStream)>;

    /// Release the handle; later commands fail with [`StoreError::Closed`].
    async fn close(&self) -> StoreResult<()>;
}

#[derive(Clone, Debug)]
enum Stored {
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Stored,
    expires_at: Option<i64>,
}

struct Subscription {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<StoreMessage>,
}

#[derive(Default)]
struct Shared {
    data: RwLock<HashMap<String, Entry>>,
    subscriptions: RwLock<HashMap<u64, Subscription>>,
    next_subscription: AtomicU64,
    unavailable: AtomicBool,
}

impl Shared {
    fn purge_expired(data: &mut HashMap<String, Entry>, key: &str, now: i64) {
        if data
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now)
        {
            data.remove(key);
        }
    }
}

/// In-process store. Clones share data; [`MemoryStore::connect`] opens a
/// separate handle onto the same data, as a second process would.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    owned: Arc<Mutex<Vec<u64>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            shared: Arc::new(Shared::default()),
            closed: Arc::new(AtomicBool::new(false)),
            owned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A new handle onto the same data and channels.
    pub fn connect(&self) -> MemoryStore {
        MemoryStore {
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
            owned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Simulate an outage: every command fails with
    /// [`StoreError::Unavailable`] until availability is restored.
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = now_millis();
        let data = self.shared.data.read();
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(_, e)| e.expires_at.map_or(true, |at| at > now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remaining time to live of `key` in milliseconds.
    pub fn ttl_ms(&self, key: &str) -> Option<i64> {
        let now = now_millis();
        self.shared
            .data
            .read()
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
            .filter(|left| *left > 0)
    }

    fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn with_entry<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        self.check()?;
        let mut data = self.shared.data.write();
        Shared::purge_expired(&mut data, key, now_millis());
        f(&mut data)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!("WRONGTYPE operation against key '{}'", key))
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        self.with_entry(key, |data| {
            let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
                value: Stored::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Stored::Hash(hash) => {
                    for (field, value) in fields {
                        hash.insert(field.clone(), value.clone());
                    }
                    Ok(())
                }
                Stored::Set(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.with_entry(key, |data| match data.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Stored::Hash(hash)) => Ok(hash.clone()),
            Some(Stored::Set(_)) => Err(wrong_type(key)),
        })
    }

    async fn expire(&self, key: &str, ttl_ms: u64) -> StoreResult<()> {
        self.with_entry(key, |data| {
            if let Some(entry) = data.get_mut(key) {
                let ttl = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
                entry.expires_at = Some(now_millis().saturating_add(ttl));
            }
            Ok(())
        })
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.with_entry(key, |data| Ok(data.contains_key(key)))
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.with_entry(key, |data| {
            data.remove(key);
            Ok(())
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        self.with_entry(key, |data| {
            let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
                value: Stored::Set(BTreeSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Stored::Set(set) => {
                    set.insert(member.to_string());
                    Ok(())
                }
                Stored::Hash(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.with_entry(key, |data| {
            let emptied = match data.get_mut(key).map(|e| &mut e.value) {
                None => return Ok(()),
                Some(Stored::Set(set)) => {
                    set.remove(member);
                    set.is_empty()
                }
                Some(Stored::Hash(_)) => return Err(wrong_type(key)),
            };
            if emptied {
                data.remove(key);
            }
            Ok(())
        })
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.with_entry(key, |data| match data.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Stored::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(Stored::Hash(_)) => Err(wrong_type(key)),
        })
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        self.with_entry(key, |data| match data.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Stored::Set(set)) => Ok(set.len()),
            Some(Stored::Hash(_)) => Err(wrong_type(key)),
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        self.check()?;
        let mut delivered = 0;
        let mut gone = Vec::new();
        {
            let subscriptions = self.shared.subscriptions.read();
            for (id, sub) in subscriptions.iter() {
                if !sub.channels.contains(channel) {
                    continue;
                }
                let message = StoreMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                };
                if sub.tx.send(message).is_ok() {
                    delivered += 1;
                } else {
                    gone.push(*id);
                }
            }
        }
        if !gone.is_empty() {
            let mut subscriptions = self.shared.subscriptions.write();
            for id in gone {
                subscriptions.remove(&id);
            }
        }
        Ok(delivered)
    }

    async fn subscriber(&self) -> StoreResult<(Box<dyn Subscriber>, MessageStream)> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.shared.subscriptions.write().insert(
            id,
            Subscription {
                channels: HashSet::new(),
                tx,
            },
        );
        self.owned.lock().push(id);
        let subscriber: Box<dyn Subscriber> = Box::new(MemorySubscriber {
            store: self.clone(),
            id,
        });
        Ok((subscriber, rx))
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let owned: Vec<u64> = self.owned.lock().drain(..).collect();
        let mut subscriptions = self.shared.subscriptions.write();
        for id in owned {
            subscriptions.remove(&id);
        }
        Ok(())
    }
}

struct MemorySubscriber {
    store: MemoryStore,
    id: u64,
}

impl MemorySubscriber {
    fn update(&self, f: impl FnOnce(&mut HashSet<String>)) -> StoreResult<()> {
        self.store.check()?;
        let mut subscriptions = self.store.shared.subscriptions.write();
        let sub = subscriptions.get_mut(&self.id).ok_or(StoreError::Closed)?;
        f(&mut sub.channels);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&self, channel: &str) -> StoreResult<()> {
        self.update(|channels| {
            channels.insert(channel.to_string());
        })
    }

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        self.update(|channels| {
            channels.remove(channel);
        })
    }
}

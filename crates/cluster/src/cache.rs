//! Distributed cache
//!
//! Values live only in the memory of the node that fetched them. Each cache
//! is registered under a prefix; mutations publish an invalidation on the
//! `cache` topic so every other node drops its copy:
//!
//! ```text
//! invalidate:<prefix>:<key>
//! invalidateAll:<prefix>
//! ```
//!
//! Receivers skip messages they published themselves. Concurrent misses on
//! one key are collapsed into a single fetch. A fetch that overlaps any write
//! or invalidation of its cache returns its value without storing it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Subscription};
use crate::error::CacheError;
use crate::message::BusMessage;

/// Topic carrying invalidations
pub const CACHE_TOPIC: &str = "cache";

const OP_INVALIDATE: &str = "invalidate";
const OP_INVALIDATE_ALL: &str = "invalidateAll";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How often expired entries are purged
    pub gc_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

#[derive(Default)]
struct Shard {
    entries: DashMap<String, Entry>,
    flights: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Bumped by every write and invalidation
    epoch: AtomicU64,
}

impl Shard {
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn remove(&self, key: &str) {
        self.bump();
        self.entries.remove(key);
    }

    fn clear(&self) {
        self.bump();
        self.entries.clear();
    }

    fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.live(now));
        before - self.entries.len()
    }
}

struct ManagerInner {
    node: String,
    bus: Option<Bus>,
    shards: DashMap<String, Arc<Shard>>,
    config: CacheConfig,
    subscription: Mutex<Option<Subscription>>,
    shutdown_tx: watch::Sender<bool>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

/// Registry of prefixed caches on one node
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    /// Node-local caches without cluster invalidation
    pub fn local(config: CacheConfig) -> Self {
        Self::build(None, "local".to_string(), config)
    }

    /// Caches kept coherent across the cluster through `bus`
    pub fn clustered(bus: Bus, config: CacheConfig) -> Result<Self, CacheError> {
        let node = bus.node_name().to_string();
        let manager = Self::build(Some(bus.clone()), node, config);

        let weak: Weak<ManagerInner> = Arc::downgrade(&manager.inner);
        let subscription = bus.subscribe_per_instance(
            CACHE_TOPIC,
            CACHE_TOPIC,
            Arc::new(move |message: BusMessage| {
                if let Some(inner) = weak.upgrade() {
                    CacheManager { inner }.apply_remote(&message);
                }
            }),
        )?;
        *manager.inner.subscription.lock() = Some(subscription);
        Ok(manager)
    }

    fn build(bus: Option<Bus>, node: String, config: CacheConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ManagerInner {
                node,
                bus,
                shards: DashMap::new(),
                config,
                subscription: Mutex::new(None),
                shutdown_tx,
                gc_task: Mutex::new(None),
            }),
        }
    }

    /// Register a cache under `prefix`
    pub fn cache(&self, prefix: &str) -> Result<Cache, CacheError> {
        if prefix.is_empty() || prefix.contains(':') {
            return Err(CacheError::InvalidPrefix(prefix.to_string()));
        }
        let shard = Arc::new(Shard::default());
        match self.inner.shards.entry(prefix.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CacheError::DuplicatePrefix(prefix.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(shard.clone());
            }
        }
        Ok(Cache {
            prefix: prefix.into(),
            shard,
            manager: self.clone(),
        })
    }

    fn apply_remote(&self, message: &BusMessage) {
        if message.origin == self.inner.node {
            return;
        }
        let text = message.text();
        let Some((op, rest)) = text.split_once(':') else {
            warn!(%text, "malformed cache message");
            return;
        };
        match op {
            OP_INVALIDATE => match rest.split_once(':') {
                Some((prefix, key)) => {
                    if let Some(shard) = self.inner.shards.get(prefix) {
                        shard.remove(key);
                    }
                }
                None => warn!(%text, "malformed cache message"),
            },
            OP_INVALIDATE_ALL => {
                if let Some(shard) = self.inner.shards.get(rest) {
                    shard.clear();
                }
            }
            _ => warn!(%text, "unknown cache operation"),
        }
    }

    async fn broadcast(&self, payload: String) -> Result<(), CacheError> {
        if let Some(bus) = &self.inner.bus {
            bus.publish(CACHE_TOPIC, payload.into_bytes()).await?;
        }
        Ok(())
    }

    /// Drop expired entries from every cache
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.inner
            .shards
            .iter()
            .map(|s| s.value().purge_expired(now))
            .sum()
    }

    /// Spawn the periodic purge
    pub fn start_gc(&self) {
        let manager = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let interval = self.inner.config.gc_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = manager.purge_expired();
                        if purged > 0 {
                            debug!(purged, "cache gc");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *self.inner.gc_task.lock() = Some(task);
        info!(interval = ?interval, "cache gc started");
    }

    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(sub) = self.inner.subscription.lock().take() {
            sub.unsubscribe();
        }
        let task = self.inner.gc_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// One prefixed cache
#[derive(Clone)]
pub struct Cache {
    prefix: Arc<str>,
    shard: Arc<Shard>,
    manager: CacheManager,
}

impl Cache {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.shard.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unexpired value of `key`
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let entry = self.shard.entries.get(key)?;
        if entry.live(now) {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn insert(&self, key: &str, value: Bytes, ttl: Duration) {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.shard
            .entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    /// Store a value; a zero `ttl` never expires. Peers drop their copies
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.shard.bump();
        self.insert(key, value, ttl);
        self.manager
            .broadcast(format!("{OP_INVALIDATE}:{}:{key}", self.prefix))
            .await
    }

    /// Value of `key`, fetching it once on a miss no matter how many callers wait
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        if let Some(v) = self.get(key) {
            return Ok(v);
        }

        let flight = self
            .shard
            .flights
            .entry(key.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = flight.lock().await;
            match self.get(key) {
                Some(v) => Ok(v),
                None => {
                    let epoch = self.shard.epoch();
                    match fetch().await {
                        Ok(v) => {
                            if self.shard.epoch() == epoch {
                                self.insert(key, v.clone(), ttl);
                                // An invalidation may land between the check and the insert
                                if self.shard.epoch() != epoch {
                                    self.shard.entries.remove_if(key, |_, e| e.value == v);
                                }
                            } else {
                                debug!(prefix = %self.prefix, %key, "cache changed during fetch, not storing");
                            }
                            Ok(v)
                        }
                        Err(e) => Err(CacheError::Fetch(e.to_string())),
                    }
                }
            }
        };
        drop(flight);
        self.shard
            .flights
            .remove_if(key, |_, f| Arc::strong_count(f) == 1);
        result
    }

    /// Drop `key` here and on every peer
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.shard.remove(key);
        self.manager
            .broadcast(format!("{OP_INVALIDATE}:{}:{key}", self.prefix))
            .await
    }

    /// Drop every key of this cache here and on every peer
    pub async fn invalidate_all(&self) -> Result<(), CacheError> {
        self.shard.clear();
        self.manager
            .broadcast(format!("{OP_INVALIDATE_ALL}:{}", self.prefix))
            .await
    }
}

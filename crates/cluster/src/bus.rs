//! Cluster message bus
//!
//! Publishers send to a topic. Every distinct channel subscribed on that topic
//! receives one copy of each message; when several subscribers share a
//! channel name (on one node or across nodes) exactly one of them gets it.
//!
//! - [`Bus::subscribe`] joins a named channel; sharing the name load balances.
//! - [`Bus::subscribe_per_instance`] suffixes the channel with the node name, so
//!   every node receives one copy.
//! - [`Bus::subscribe_unique`] uses a fresh channel, so this subscriber always
//!   receives a copy.
//!
//! The publisher picks the receiving node of each channel by rendezvous hashing
//! the message id over the nodes that advertise the channel, then sends one
//! frame per node. The receiving node rotates over its local subscribers.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::BusError;
use crate::finder::{PeerFinder, StaticFinder};
use crate::membership::{ChannelKey, MemberEvent, MemberView, Membership, MembershipTimeouts};
use crate::message::{BusMessage, WireMessage};
use crate::transport::PeerTransport;

/// Message callback; must not block
pub type Handler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Node identity, unique in the cluster
    pub node_name: String,
    /// Address peers use to reach this node's daemon port
    pub address: String,
    pub gossip_interval: Duration,
    pub discovery_interval: Duration,
    /// Peers contacted per gossip round
    pub fanout: usize,
    pub timeouts: MembershipTimeouts,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            node_name: "direktiv-local".to_string(),
            address: "127.0.0.1:4150".to_string(),
            gossip_interval: Duration::from_secs(1),
            discovery_interval: Duration::from_secs(15),
            fanout: 3,
            timeouts: MembershipTimeouts::default(),
        }
    }
}

impl BusConfig {
    pub fn new(node_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    pub fn with_timeouts(mut self, timeouts: MembershipTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[derive(Default)]
struct ChannelGroup {
    handlers: Vec<(u64, Handler)>,
    cursor: usize,
}

struct Inner {
    config: BusConfig,
    transport: Arc<dyn PeerTransport>,
    finder: RwLock<Arc<dyn PeerFinder>>,
    seeds: RwLock<Vec<String>>,
    membership: RwLock<Membership>,
    groups: DashMap<ChannelKey, ChannelGroup>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the cluster bus; cheap to clone
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

/// Returned by subscribe; pass to [`Subscription::unsubscribe`] to stop delivery
#[must_use = "dropping a Subscription keeps the handler subscribed"]
pub struct Subscription {
    bus: Weak<Inner>,
    key: ChannelKey,
    id: u64,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.key.channel
    }

    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            Bus { inner }.remove_handler(&self.key, self.id);
        }
    }
}

impl Bus {
    pub fn new(
        config: BusConfig,
        transport: Arc<dyn PeerTransport>,
        finder: Arc<dyn PeerFinder>,
    ) -> Self {
        let membership = Membership::new(&config.node_name, &config.address, config.timeouts);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                finder: RwLock::new(finder),
                seeds: RwLock::new(Vec::new()),
                membership: RwLock::new(membership),
                groups: DashMap::new(),
                next_id: AtomicU64::new(1),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.inner.config.node_name
    }

    pub fn address(&self) -> &str {
        &self.inner.config.address
    }

    // ========================================================================
    // Subscribe / publish
    // ========================================================================

    /// Subscribe `handler` to `channel` on `topic`
    pub fn subscribe(&self, topic: &str, channel: &str, handler: Handler) -> Result<Subscription, BusError> {
        validate_name("topic", topic)?;
        validate_name("channel", channel)?;

        let key = ChannelKey::new(topic, channel);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .groups
            .entry(key.clone())
            .or_default()
            .handlers
            .push((id, handler));
        self.inner.membership.write().add_channel(key.clone());

        debug!(topic, channel, "subscribed");
        Ok(Subscription {
            bus: Arc::downgrade(&self.inner),
            key,
            id,
        })
    }

    /// Subscribe with the channel suffixed by this node's name
    pub fn subscribe_per_instance(
        &self,
        topic: &str,
        channel: &str,
        handler: Handler,
    ) -> Result<Subscription, BusError> {
        let channel = format!("{channel}-{}", self.node_name());
        self.subscribe(topic, &channel, handler)
    }

    /// Subscribe on a fresh channel nobody else shares
    pub fn subscribe_unique(&self, topic: &str, handler: Handler) -> Result<Subscription, BusError> {
        let channel = uuid::Uuid::new_v4().simple().to_string();
        self.subscribe(topic, &channel, handler)
    }

    fn remove_handler(&self, key: &ChannelKey, id: u64) {
        let now_empty = match self.inner.groups.get_mut(key) {
            Some(mut group) => {
                group.handlers.retain(|(h, _)| *h != id);
                group.handlers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.inner.groups.remove_if(key, |_, g| g.handlers.is_empty());
            self.inner.membership.write().remove_channel(key);
        }
        debug!(topic = %key.topic, channel = %key.channel, "unsubscribed");
    }

    /// Publish `payload` on `topic`
    #[instrument(skip(self, payload), fields(node = %self.node_name()))]
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        validate_name("topic", topic).map_err(|e| BusError::Transport(e.to_string()))?;
        let message = BusMessage::new(topic, self.node_name(), payload);

        let (targets, addresses) = {
            let membership = self.inner.membership.read();
            let mut targets: HashMap<String, Vec<String>> = HashMap::new();
            for (channel, nodes) in membership.channel_nodes(topic) {
                if let Some(node) = pick_node(&message, &nodes) {
                    targets.entry(node.clone()).or_default().push(channel);
                }
            }
            let addresses: HashMap<String, String> = targets
                .keys()
                .filter_map(|n| membership.address_of(n).map(|a| (n.clone(), a)))
                .collect();
            (targets, addresses)
        };

        let mut failures = Vec::new();
        for (node, channels) in targets {
            if node == self.node_name() {
                self.deliver_local(&channels, &message);
                continue;
            }
            let Some(address) = addresses.get(&node) else {
                failures.push(format!("{node}: no address"));
                continue;
            };
            let frame = WireMessage::Deliver {
                channels,
                message: message.clone(),
            };
            if let Err(e) = self.inner.transport.send(address, frame).await {
                warn!(%node, error = %e, "publish to peer failed");
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::Transport(failures.join("; ")))
        }
    }

    fn deliver_local(&self, channels: &[String], message: &BusMessage) {
        for channel in channels {
            let key = ChannelKey::new(message.topic.clone(), channel.clone());
            let handler = match self.inner.groups.get_mut(&key) {
                Some(mut group) if !group.handlers.is_empty() => {
                    let idx = group.cursor % group.handlers.len();
                    group.cursor = group.cursor.wrapping_add(1);
                    group.handlers[idx].1.clone()
                }
                _ => {
                    debug!(topic = %message.topic, %channel, "no local subscriber, dropping");
                    continue;
                }
            };
            handler(message.clone());
        }
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Alive nodes, this one included
    pub fn nodes(&self) -> Vec<MemberView> {
        self.inner.membership.read().alive()
    }

    /// Replace the peer list and contact the new peers immediately
    pub async fn update_nodes(&self, addresses: Vec<String>) {
        info!(count = addresses.len(), "bus peer list updated");
        *self.inner.finder.write() = Arc::new(StaticFinder::new(addresses));
        self.discover().await;
        self.gossip_round().await;
    }

    /// Refresh seed addresses from the finder
    pub async fn discover(&self) {
        let finder = self.inner.finder.read().clone();
        match finder.find().await {
            Ok(found) => {
                let own = self.address().to_string();
                *self.inner.seeds.write() = found.into_iter().filter(|a| *a != own).collect();
            }
            Err(e) => warn!(error = %e, "bus peer discovery failed"),
        }
    }

    /// One gossip round: beat, detect failures, push state to peers
    pub async fn gossip_round(&self) {
        let (views, targets) = {
            let mut membership = self.inner.membership.write();
            membership.beat();
            for event in membership.tick() {
                log_event(&event);
            }
            let views = membership.views();
            let known: Vec<String> = membership
                .alive()
                .into_iter()
                .filter(|m| m.name != self.node_name())
                .map(|m| m.address)
                .collect();

            let mut targets: Vec<String> = known
                .choose_multiple(&mut rand::thread_rng(), self.inner.config.fanout)
                .cloned()
                .collect();
            for seed in self.inner.seeds.read().iter() {
                if !known.contains(seed) && !targets.contains(seed) {
                    targets.push(seed.clone());
                }
            }
            (views, targets)
        };

        for address in targets {
            let frame = WireMessage::Gossip {
                from: self.node_name().to_string(),
                members: views.clone(),
            };
            if let Err(e) = self.inner.transport.send(&address, frame).await {
                debug!(%address, error = %e, "gossip send failed");
            }
        }
    }

    /// Process a frame received from a peer
    pub async fn handle_frame(&self, frame: WireMessage) {
        match frame {
            WireMessage::Deliver { channels, message } => self.deliver_local(&channels, &message),
            WireMessage::Gossip { from, members } => {
                let (events, reply_to) = {
                    let mut membership = self.inner.membership.write();
                    let events = membership.merge(members);
                    let joined = events
                        .iter()
                        .any(|e| matches!(e, MemberEvent::Joined(n) | MemberEvent::Recovered(n) if *n == from));
                    let reply_to = joined.then(|| membership.address_of(&from)).flatten();
                    (events, reply_to)
                };
                for event in &events {
                    log_event(event);
                }
                // Bring a newcomer up to date without waiting for its turn in our fanout
                if let Some(address) = reply_to {
                    let frame = WireMessage::Gossip {
                        from: self.node_name().to_string(),
                        members: self.inner.membership.read().views(),
                    };
                    if let Err(e) = self.inner.transport.send(&address, frame).await {
                        debug!(%address, error = %e, "gossip reply failed");
                    }
                }
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start discovery and gossip loops
    pub fn start(&self) {
        let gossip = {
            let bus = self.clone();
            let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move {
                bus.discover().await;
                let mut ticker = tokio::time::interval(bus.inner.config.gossip_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => bus.gossip_round().await,
                        _ = shutdown_rx.changed() => {
                            debug!("gossip loop shutting down");
                            break;
                        }
                    }
                }
            })
        };

        let discovery = {
            let bus = self.clone();
            let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(bus.inner.config.discovery_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => bus.discover().await,
                        _ = shutdown_rx.changed() => break,
                    }
                }
            })
        };

        let mut tasks = self.inner.tasks.lock();
        tasks.push(gossip);
        tasks.push(discovery);
        info!(node = %self.node_name(), address = %self.address(), "bus started");
    }

    /// Feed frames from an in-process inbox
    pub fn serve_inbox(&self, mut inbox: mpsc::UnboundedReceiver<WireMessage>) {
        let bus = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = inbox.recv() => match frame {
                        Some(frame) => bus.handle_frame(frame).await,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    /// Announce departure and stop background loops
    pub async fn shutdown(&self) {
        info!(node = %self.node_name(), "bus leaving cluster");
        self.inner.membership.write().leave();
        let (views, targets) = {
            let membership = self.inner.membership.read();
            let targets: Vec<String> = membership
                .alive()
                .into_iter()
                .filter(|m| m.name != self.node_name())
                .map(|m| m.address)
                .collect();
            (membership.views(), targets)
        };
        for address in targets {
            let frame = WireMessage::Gossip {
                from: self.node_name().to_string(),
                members: views.clone(),
            };
            let _ = self.inner.transport.send(&address, frame).await;
        }

        let _ = self.inner.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

fn validate_name(what: &str, name: &str) -> Result<(), BusError> {
    if name.is_empty() || name.len() > 64 || name.chars().any(|c| c.is_whitespace()) {
        return Err(BusError::Subscribe(format!("invalid {what} name '{name}'")));
    }
    Ok(())
}

/// Rendezvous choice of the node that receives a message for one channel
fn pick_node<'a>(message: &BusMessage, nodes: &'a [String]) -> Option<&'a String> {
    nodes.iter().max_by_key(|node| {
        let mut h = DefaultHasher::new();
        message.id.hash(&mut h);
        node.hash(&mut h);
        h.finish()
    })
}

fn log_event(event: &MemberEvent) {
    match event {
        MemberEvent::Joined(n) => info!(node = %n, "bus node joined"),
        MemberEvent::Recovered(n) => info!(node = %n, "bus node recovered"),
        MemberEvent::Failed(n) => warn!(node = %n, "bus node failed"),
        MemberEvent::Left(n) => info!(node = %n, "bus node left"),
        MemberEvent::Reaped(n) => info!(node = %n, "bus node reaped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalNetwork;
    use std::sync::atomic::AtomicUsize;

    fn local_bus(name: &str) -> Bus {
        let net = LocalNetwork::new();
        Bus::new(
            BusConfig::new(name, name),
            Arc::new(net.transport()),
            Arc::new(StaticFinder::default()),
        )
    }

    fn counter() -> (Arc<AtomicUsize>, Handler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn test_shared_channel_is_load_balanced() {
        let bus = local_bus("a");
        let (c1, h1) = counter();
        let (c2, h2) = counter();
        let _s1 = bus.subscribe("jobs", "workers", h1).unwrap();
        let _s2 = bus.subscribe("jobs", "workers", h2).unwrap();

        for _ in 0..10 {
            bus.publish("jobs", b"x".to_vec()).await.unwrap();
        }
        assert_eq!(c1.load(Ordering::SeqCst) + c2.load(Ordering::SeqCst), 10);
        assert_eq!(c1.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_distinct_channels_each_get_a_copy() {
        let bus = local_bus("a");
        let (c1, h1) = counter();
        let (c2, h2) = counter();
        let _s1 = bus.subscribe_unique("events", h1).unwrap();
        let _s2 = bus.subscribe_unique("events", h2).unwrap();

        bus.publish("events", b"x".to_vec()).await.unwrap();
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = local_bus("a");
        let (count, handler) = counter();
        let sub = bus.subscribe("t", "c", handler).unwrap();
        bus.publish("t", vec![]).await.unwrap();
        sub.unsubscribe();
        bus.publish("t", vec![]).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = local_bus("a");
        bus.publish("nobody", b"x".to_vec()).await.unwrap();
    }

    #[test]
    fn test_invalid_names_rejected() {
        let bus = local_bus("a");
        let (_, handler) = counter();
        assert!(matches!(
            bus.subscribe("", "c", handler.clone()),
            Err(BusError::Subscribe(_))
        ));
        assert!(matches!(
            bus.subscribe("t", "has space", handler),
            Err(BusError::Subscribe(_))
        ));
    }

    #[test]
    fn test_per_instance_channel_suffix() {
        let bus = local_bus("node-1");
        let (_, handler) = counter();
        let sub = bus.subscribe_per_instance("cache", "cache", handler).unwrap();
        assert_eq!(sub.channel(), "cache-node-1");
    }

    #[test]
    fn test_pick_node_is_stable() {
        let msg = BusMessage::new("t", "a", vec![]);
        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let first = pick_node(&msg, &nodes).cloned();
        assert_eq!(pick_node(&msg, &nodes).cloned(), first);
        assert!(pick_node(&msg, &[]).is_none());
    }
}

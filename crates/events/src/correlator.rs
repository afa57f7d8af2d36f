// Event correlator
// Decision: Listener matching happens under one short lock; sink calls happen after it is released
// Decision: When bound to the bus, every node ingests every broadcast and matches its own listeners

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_cluster::{Bus, BusMessage, Subscription};
use direktiv_core::Clock;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cloudevent::CloudEvent;
use crate::error::CorrelatorError;
use crate::listener::{Expired, Fired, Listener, ListenerInfo, ListenerOwner, ListenerSpec};

/// Bus topic carrying broadcast events
pub const EVENTS_TOPIC: &str = "events";

/// Receives fired and expired listeners
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn fired(&self, fired: Fired);
    async fn expired(&self, expired: Expired);
}

/// A broadcast event as kept in namespace history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub namespace: String,
    pub received_at: DateTime<Utc>,
    pub event: CloudEvent,
}

#[derive(Debug, Serialize, Deserialize)]
struct BusEnvelope {
    namespace: String,
    event: CloudEvent,
}

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Events kept per namespace
    pub history_limit: usize,
    pub sweep_interval: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl CorrelatorConfig {
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

struct Inner {
    config: CorrelatorConfig,
    /// Deadlines and history timestamps are read from here
    clock: Clock,
    sink: Arc<dyn EventSink>,
    /// Listeners by namespace
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    history: Mutex<HashMap<String, VecDeque<EventRecord>>>,
    bus: RwLock<Option<(Bus, Subscription)>>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::with_clock(config, sink, Clock::new())
    }

    /// Correlator sharing the time source of the engine arming its deadlines
    pub fn with_clock(config: CorrelatorConfig, sink: Arc<dyn EventSink>, clock: Clock) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                sink,
                listeners: RwLock::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                bus: RwLock::new(None),
                shutdown_tx,
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Receive broadcasts from every node through `bus`
    pub fn bind(&self, bus: Bus) -> Result<(), CorrelatorError> {
        let weak = Arc::downgrade(&self.inner);
        let subscription = bus.subscribe_per_instance(
            EVENTS_TOPIC,
            EVENTS_TOPIC,
            Arc::new(move |message: BusMessage| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let envelope: BusEnvelope = match serde_json::from_slice(&message.payload) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed event message");
                        return;
                    }
                };
                let correlator = Correlator { inner };
                tokio::spawn(async move {
                    correlator.ingest(&envelope.namespace, envelope.event).await;
                });
            }),
        )?;
        *self.inner.bus.write() = Some((bus, subscription));
        Ok(())
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn register(&self, spec: ListenerSpec) -> Result<Uuid, CorrelatorError> {
        let listener = Listener::new(spec, self.now())?;
        let id = listener.id;
        debug!(%id, namespace = %listener.spec.namespace, kind = ?listener.spec.kind, "listener registered");
        self.inner
            .listeners
            .write()
            .entry(listener.spec.namespace.clone())
            .or_default()
            .push(listener);
        Ok(id)
    }

    pub fn cancel(&self, id: Uuid) -> Result<(), CorrelatorError> {
        let mut listeners = self.inner.listeners.write();
        for list in listeners.values_mut() {
            if let Some(pos) = list.iter().position(|l| l.id == id) {
                list.remove(pos);
                return Ok(());
            }
        }
        Err(CorrelatorError::NotFound(id))
    }

    /// Drop every listener of an owner; returns how many were removed
    pub fn cancel_owner(&self, namespace: &str, owner: &ListenerOwner) -> usize {
        let mut listeners = self.inner.listeners.write();
        let Some(list) = listeners.get_mut(namespace) else {
            return 0;
        };
        let before = list.len();
        list.retain(|l| l.spec.owner != *owner);
        before - list.len()
    }

    /// Drop every listener of an instance regardless of state
    pub fn cancel_instance(&self, namespace: &str, instance_id: Uuid) -> usize {
        let mut listeners = self.inner.listeners.write();
        let Some(list) = listeners.get_mut(namespace) else {
            return 0;
        };
        let before = list.len();
        list.retain(|l| !matches!(&l.spec.owner, ListenerOwner::Instance { instance_id: id, .. } if *id == instance_id));
        before - list.len()
    }

    /// Replace all start-trigger listeners of a namespace
    pub fn replace_triggers(
        &self,
        namespace: &str,
        specs: Vec<ListenerSpec>,
    ) -> Result<usize, CorrelatorError> {
        let now = self.now();
        let mut fresh = Vec::with_capacity(specs.len());
        for spec in specs {
            fresh.push(Listener::new(spec, now)?);
        }
        let count = fresh.len();
        let mut listeners = self.inner.listeners.write();
        let list = listeners.entry(namespace.to_string()).or_default();
        list.retain(|l| !l.is_persistent());
        list.extend(fresh);
        info!(%namespace, count, "start triggers replaced");
        Ok(count)
    }

    /// Drop all state of a namespace
    pub fn remove_namespace(&self, namespace: &str) {
        self.inner.listeners.write().remove(namespace);
        self.inner.history.lock().remove(namespace);
    }

    pub fn listeners(&self, namespace: &str) -> Vec<ListenerInfo> {
        self.inner
            .listeners
            .read()
            .get(namespace)
            .map(|list| list.iter().map(Listener::info).collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Broadcast
    // ========================================================================

    /// Accept an event for a namespace; fans out to every node when bound to a bus
    #[instrument(skip(self, event), fields(event_type = %event.event_type, event_id = %event.id))]
    pub async fn broadcast(&self, namespace: &str, event: CloudEvent) -> Result<(), CorrelatorError> {
        event.validate()?;
        let bus = self.inner.bus.read().as_ref().map(|(b, _)| b.clone());
        match bus {
            Some(bus) => {
                let payload = serde_json::to_vec(&BusEnvelope {
                    namespace: namespace.to_string(),
                    event,
                })
                .map_err(|e| CorrelatorError::InvalidEvent(e.to_string()))?;
                bus.publish(EVENTS_TOPIC, payload).await?;
            }
            None => {
                self.ingest(namespace, event).await;
            }
        }
        Ok(())
    }

    /// Match an event against local listeners and notify the sink; returns how many fired
    pub async fn ingest(&self, namespace: &str, event: CloudEvent) -> usize {
        let now = self.now();
        self.record(namespace, &event, now);

        let fired: Vec<Fired> = {
            let mut listeners = self.inner.listeners.write();
            let Some(list) = listeners.get_mut(namespace) else {
                return 0;
            };
            let mut fired = Vec::new();
            list.retain_mut(|listener| {
                if listener.expired(now) {
                    // Left for the sweeper
                    return true;
                }
                match listener.offer(&event, now) {
                    Some(f) => {
                        fired.push(f);
                        listener.is_persistent()
                    }
                    None => true,
                }
            });
            fired
        };

        let count = fired.len();
        for f in fired {
            debug!(listener = %f.listener_id, %namespace, "listener fired");
            self.inner.sink.fired(f).await;
        }
        count
    }

    fn record(&self, namespace: &str, event: &CloudEvent, now: DateTime<Utc>) {
        let mut history = self.inner.history.lock();
        let entries = history.entry(namespace.to_string()).or_default();
        entries.push_back(EventRecord {
            namespace: namespace.to_string(),
            received_at: now,
            event: event.clone(),
        });
        while entries.len() > self.inner.config.history_limit {
            entries.pop_front();
        }
    }

    /// Recent events of a namespace, newest first
    pub fn history(&self, namespace: &str, limit: usize) -> Vec<EventRecord> {
        self.inner
            .history
            .lock()
            .get(namespace)
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Deadlines
    // ========================================================================

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Remove listeners past their deadline and notify the sink
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Expired> = {
            let mut listeners = self.inner.listeners.write();
            let mut expired = Vec::new();
            for list in listeners.values_mut() {
                list.retain(|l| {
                    if l.expired(now) {
                        expired.push(Expired {
                            listener_id: l.id,
                            namespace: l.spec.namespace.clone(),
                            owner: l.spec.owner.clone(),
                        });
                        false
                    } else {
                        true
                    }
                });
            }
            expired
        };
        let count = expired.len();
        for e in expired {
            debug!(listener = %e.listener_id, "listener deadline passed");
            self.inner.sink.expired(e).await;
        }
        count
    }

    pub fn start_sweeper(&self) {
        let correlator = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let interval = self.inner.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        correlator.sweep(correlator.now()).await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("event sweeper shutting down");
                        break;
                    }
                }
            }
        });
        *self.inner.sweeper.lock() = Some(handle);
    }

    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        if let Some((_, sub)) = self.inner.bus.write().take() {
            sub.unsubscribe();
        }
        let handle = self.inner.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

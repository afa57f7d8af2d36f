//! Instance status fan-out
//!
//! Every checkpoint publishes a [`StatusUpdate`]. Watchers subscribe to a
//! per-instance watch channel; updates arriving out of order (for example a
//! bus echo of an older checkpoint) are dropped so observers see a monotonic
//! sequence that ends with the terminal state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use direktiv_core::{InstanceData, InstanceStatus};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

/// Bus topic carrying status updates between nodes
pub const STATUS_TOPIC: &str = "instance-status";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: Uuid,
    pub namespace: String,
    pub status: InstanceStatus,
    /// Current (or last) state
    pub state: Option<String>,
    /// Length of the flow trail; grows by one per state entry
    pub steps: usize,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn of(instance: &InstanceData) -> Self {
        Self {
            id: instance.id,
            namespace: instance.namespace.clone(),
            status: instance.status,
            state: instance.flow.last().cloned(),
            steps: instance.flow.len(),
            error_code: instance.error_code.clone(),
            error_message: instance.error_message.clone(),
            updated_at: instance.updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `self` is newer than `current`
    fn supersedes(&self, current: &StatusUpdate) -> bool {
        if current.is_terminal() {
            return false;
        }
        self.is_terminal() || self.steps > current.steps || self.updated_at > current.updated_at
    }
}

#[derive(Default)]
pub(crate) struct StatusHub {
    channels: DashMap<Uuid, watch::Sender<StatusUpdate>>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an update; returns false when it was stale
    pub fn publish(&self, update: StatusUpdate) -> bool {
        let id = update.id;
        let terminal = update.is_terminal();
        let accepted = match self.channels.get(&id) {
            Some(tx) => tx.send_if_modified(|current| {
                if update.supersedes(current) {
                    *current = update;
                    true
                } else {
                    false
                }
            }),
            None => {
                if !terminal {
                    let (tx, _) = watch::channel(update);
                    self.channels.insert(id, tx);
                }
                true
            }
        };
        if terminal {
            // Receivers keep the final value after the sender is gone
            self.channels.remove(&id);
        }
        accepted
    }

    /// Subscribe, seeding the channel with `snapshot` when nobody published yet
    pub fn subscribe(&self, snapshot: StatusUpdate) -> watch::Receiver<StatusUpdate> {
        let entry = self
            .channels
            .entry(snapshot.id)
            .or_insert_with(|| watch::channel(snapshot.clone()).0);
        let rx = entry.subscribe();
        drop(entry);
        let current = rx.borrow().clone();
        if snapshot.supersedes(&current) {
            self.publish(snapshot);
        } else if current.is_terminal() {
            self.channels.remove(&current.id);
        }
        rx
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

/// Stream of updates ending with (and including) the terminal one
pub(crate) fn updates(rx: watch::Receiver<StatusUpdate>) -> impl Stream<Item = StatusUpdate> {
    let first = rx.borrow().clone();
    let done = first.is_terminal();
    let rest = stream::unfold((rx, done), |(mut rx, done)| async move {
        if done {
            return None;
        }
        match rx.changed().await {
            Ok(()) => {
                let update = rx.borrow_and_update().clone();
                let done = update.is_terminal();
                Some((update, (rx, done)))
            }
            Err(_) => {
                // Sender dropped: surface the last value if it is terminal
                let update = rx.borrow().clone();
                if update.is_terminal() {
                    Some((update, (rx, true)))
                } else {
                    None
                }
            }
        }
    });
    stream::once(async move { first }).chain(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: Uuid, status: InstanceStatus, steps: usize) -> StatusUpdate {
        StatusUpdate {
            id,
            namespace: "ns".to_string(),
            status,
            state: Some(format!("s{steps}")),
            steps,
            error_code: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_stream_ends_with_terminal_update() {
        let hub = StatusHub::new();
        let id = Uuid::new_v4();
        let rx = hub.subscribe(update(id, InstanceStatus::Pending, 0));

        let collector = tokio::spawn(updates(rx).collect::<Vec<_>>());
        tokio::task::yield_now().await;
        hub.publish(update(id, InstanceStatus::Pending, 1));
        tokio::task::yield_now().await;
        hub.publish(update(id, InstanceStatus::Complete, 2));

        let seen = collector.await.unwrap();
        assert!(seen.last().unwrap().is_terminal());
        assert_eq!(seen.last().unwrap().steps, 2);
        let steps: Vec<usize> = seen.iter().map(|u| u.steps).collect();
        let mut sorted = steps.clone();
        sorted.sort();
        assert_eq!(steps, sorted);
        assert_eq!(hub.len(), 0);
    }

    #[test]
    fn test_stale_update_dropped() {
        let hub = StatusHub::new();
        let id = Uuid::new_v4();
        assert!(hub.publish(update(id, InstanceStatus::Pending, 3)));
        let mut old = update(id, InstanceStatus::Pending, 2);
        old.updated_at = Utc::now() - chrono::Duration::seconds(10);
        assert!(!hub.publish(old));
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal_yields_once() {
        let hub = StatusHub::new();
        let id = Uuid::new_v4();
        let rx = hub.subscribe(update(id, InstanceStatus::Failed, 4));
        let seen: Vec<_> = updates(rx).collect().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, InstanceStatus::Failed);
    }
}

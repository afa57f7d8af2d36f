// Instance leases
// Decision: A worker must hold the instance lease before advancing it
// Decision: A local set short-circuits contention between workers of the same node
// Decision: Work run under `hold` renews the lease every third of its TTL and is dropped once it is lost

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use direktiv_storage::{LeaseStore, StoreError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

/// Exclusive right to advance one instance
#[derive(Clone)]
pub struct InstanceLeases {
    holder: String,
    ttl: Duration,
    store: Arc<dyn LeaseStore>,
    local: Arc<DashSet<Uuid>>,
}

impl InstanceLeases {
    pub fn new(holder: impl Into<String>, ttl: Duration, store: Arc<dyn LeaseStore>) -> Self {
        Self {
            holder: holder.into(),
            ttl,
            store,
            local: Arc::new(DashSet::new()),
        }
    }

    fn key(id: Uuid) -> String {
        format!("instance:{id}")
    }

    /// Take the lease of `id`; `None` when another worker holds it
    pub async fn try_acquire(&self, id: Uuid) -> Result<Option<InstanceLease>, StoreError> {
        if !self.local.insert(id) {
            return Ok(None);
        }
        match self.store.acquire_lease(&Self::key(id), &self.holder, self.ttl).await {
            Ok(true) => Ok(Some(InstanceLease {
                id,
                leases: self.clone(),
                released: false,
            })),
            Ok(false) => {
                self.local.remove(&id);
                Ok(None)
            }
            Err(e) => {
                self.local.remove(&id);
                Err(e)
            }
        }
    }

    pub fn is_held_locally(&self, id: Uuid) -> bool {
        self.local.contains(&id)
    }
}

/// Held instance lease; release explicitly, dropping only frees it locally
pub struct InstanceLease {
    id: Uuid,
    leases: InstanceLeases,
    released: bool,
}

impl InstanceLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Extend the lease while a long step is running
    pub async fn renew(&self) -> Result<bool, StoreError> {
        self.leases
            .store
            .acquire_lease(&InstanceLeases::key(self.id), &self.leases.holder, self.leases.ttl)
            .await
    }

    /// Run `work` while keeping the lease alive; `None` when another holder took it over
    pub async fn hold<F: Future>(&self, work: F) -> Option<F::Output> {
        let every = (self.leases.ttl / 3).max(Duration::from_millis(10));
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return Some(out),
                _ = ticker.tick() => match self.renew().await {
                    Ok(true) => debug!(instance = %self.id, "instance lease renewed"),
                    Ok(false) => {
                        warn!(instance = %self.id, "instance lease lost, abandoning work");
                        return None;
                    }
                    Err(e) => warn!(instance = %self.id, error = %e, "renewing instance lease failed"),
                },
            }
        }
    }

    pub async fn release(mut self) {
        self.released = true;
        self.leases.local.remove(&self.id);
        if let Err(e) = self
            .leases
            .store
            .release_lease(&InstanceLeases::key(self.id), &self.leases.holder)
            .await
        {
            warn!(instance = %self.id, error = %e, "failed to release instance lease");
        }
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if !self.released {
            // The store entry expires on its own
            self.leases.local.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use direktiv_storage::MemoryStore;

    #[tokio::test]
    async fn test_exclusive_across_nodes() {
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryStore::new());
        let a = InstanceLeases::new("a", Duration::from_secs(30), store.clone());
        let b = InstanceLeases::new("b", Duration::from_secs(30), store);
        let id = Uuid::new_v4();

        let lease = a.try_acquire(id).await.unwrap().unwrap();
        assert!(a.try_acquire(id).await.unwrap().is_none());
        assert!(b.try_acquire(id).await.unwrap().is_none());

        lease.release().await;
        assert!(!a.is_held_locally(id));
        assert!(b.try_acquire(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_hold_renews_past_ttl() {
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryStore::new());
        let a = InstanceLeases::new("a", Duration::from_millis(150), store.clone());
        let b = InstanceLeases::new("b", Duration::from_millis(150), store);
        let id = Uuid::new_v4();

        let lease = a.try_acquire(id).await.unwrap().unwrap();
        let work = async {
            // Outlives the TTL several times over
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(b.try_acquire(id).await.unwrap().is_none());
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(b.try_acquire(id).await.unwrap().is_none());
            7
        };
        assert_eq!(lease.hold(work).await, Some(7));

        lease.release().await;
        assert!(b.try_acquire(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_hold_abandons_work_once_taken_over() {
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryStore::new());
        let a = InstanceLeases::new("a", Duration::from_millis(60), store.clone());
        let id = Uuid::new_v4();
        let lease = a.try_acquire(id).await.unwrap().unwrap();

        // Another node takes over the store entry behind the holder's back
        store
            .release_lease(&InstanceLeases::key(id), "a")
            .await
            .unwrap();
        assert!(store
            .acquire_lease(&InstanceLeases::key(id), "b", Duration::from_secs(30))
            .await
            .unwrap());

        let finished = lease
            .hold(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
        assert!(finished.is_none());
        drop(lease);
        assert!(!a.is_held_locally(id));
    }

    #[tokio::test]
    async fn test_drop_frees_local_slot() {
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryStore::new());
        let a = InstanceLeases::new("a", Duration::from_secs(30), store);
        let id = Uuid::new_v4();
        {
            let _lease = a.try_acquire(id).await.unwrap().unwrap();
            assert!(a.is_held_locally(id));
        }
        // Same holder re-acquires its own unexpired lease
        assert!(a.try_acquire(id).await.unwrap().is_some());
    }
}

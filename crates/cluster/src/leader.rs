// Leader election over the lease store
// Decision: One lease key names the leader; the holder identity is the pod name
// Decision: Leader-only tasks start on acquisition and are aborted when the lease is lost

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use direktiv_storage::LeaseStore;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lease key of the cluster leader
pub const LEADER_KEY: &str = "direktiv-leader";

type TaskFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct LeaderTask {
    name: String,
    interval: Duration,
    run: TaskFn,
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Identity of this node, normally POD_NAME
    pub holder: String,
    pub ttl: Duration,
    /// How often the lease is renewed or contested
    pub renew_interval: Duration,
}

impl LeaderConfig {
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }
}

/// Contends for leadership and runs periodic tasks while leader
#[derive(Clone)]
pub struct LeaderElector {
    config: LeaderConfig,
    leases: Arc<dyn LeaseStore>,
    tasks: Arc<Mutex<Vec<LeaderTask>>>,
    running: Arc<Mutex<Vec<JoinHandle<()>>>>,
    leader_tx: Arc<watch::Sender<bool>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LeaderElector {
    pub fn new(config: LeaderConfig, leases: Arc<dyn LeaseStore>) -> Self {
        let (leader_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            leases,
            tasks: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(Mutex::new(Vec::new())),
            leader_tx: Arc::new(leader_tx),
            shutdown_tx: Arc::new(shutdown_tx),
            loop_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Register `run` to be called every `interval` while this node leads
    pub fn register<F, Fut>(&self, name: &str, interval: Duration, run: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(LeaderTask {
            name: name.to_string(),
            interval,
            run: Arc::new(move || Box::pin(run())),
        });
    }

    pub fn is_leader(&self) -> bool {
        *self.leader_tx.borrow()
    }

    /// Observe leadership changes
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    /// One election step: acquire or renew, then start or stop tasks
    pub async fn step(&self) {
        let held = match self
            .leases
            .acquire_lease(LEADER_KEY, &self.config.holder, self.config.ttl)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                // Without a confirmed renewal the lease may already belong to someone else
                error!(error = %e, "leader lease renewal failed");
                false
            }
        };

        let was = self.is_leader();
        if held && !was {
            info!(holder = %self.config.holder, "became leader");
            self.start_tasks();
            let _ = self.leader_tx.send(true);
        } else if !held && was {
            warn!(holder = %self.config.holder, "lost leadership");
            self.stop_tasks();
            let _ = self.leader_tx.send(false);
        }
    }

    fn start_tasks(&self) {
        let tasks = self.tasks.lock();
        let mut running = self.running.lock();
        for task in tasks.iter() {
            let run = task.run.clone();
            let interval = task.interval;
            let name = task.name.clone();
            running.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    debug!(task = %name, "leader task tick");
                    run().await;
                }
            }));
        }
    }

    fn stop_tasks(&self) {
        for handle in self.running.lock().drain(..) {
            handle.abort();
        }
    }

    /// Spawn the election loop
    pub fn start(&self) {
        let elector = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(elector.config.renew_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => elector.step().await,
                    _ = shutdown_rx.changed() => {
                        debug!("leader election shutting down");
                        break;
                    }
                }
            }
        });
        *self.loop_handle.lock() = Some(handle);
    }

    /// Stop the loop, abort tasks and give up the lease
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.stop_tasks();
        if self.is_leader() {
            if let Err(e) = self
                .leases
                .release_lease(LEADER_KEY, &self.config.holder)
                .await
            {
                warn!(error = %e, "failed to release leader lease");
            }
            let _ = self.leader_tx.send(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use direktiv_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_single_leader() {
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryStore::new());
        let a = LeaderElector::new(LeaderConfig::new("a"), store.clone());
        let b = LeaderElector::new(LeaderConfig::new("b"), store.clone());

        a.step().await;
        b.step().await;
        assert!(a.is_leader());
        assert!(!b.is_leader());

        a.shutdown().await;
        b.step().await;
        assert!(b.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_only_while_leading() {
        let store = Arc::new(MemoryStore::new());
        let elector = LeaderElector::new(LeaderConfig::new("a"), store.clone());
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        elector.register("count", Duration::from_secs(1), move || {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        elector.step().await;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let while_leading = runs.load(Ordering::SeqCst);
        assert!(while_leading >= 2);

        // Someone else takes the lease
        store.release_lease(LEADER_KEY, "a").await.unwrap();
        store
            .acquire_lease(LEADER_KEY, "b", Duration::from_secs(60))
            .await
            .unwrap();
        elector.step().await;
        assert!(!elector.is_leader());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), while_leading);
    }
}

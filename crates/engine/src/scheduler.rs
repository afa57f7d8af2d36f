//! Run queue and timers
//!
//! Instance ids are pushed onto an unbounded queue; a dispatcher hands each
//! one to the process function under a concurrency permit. Timers are plain
//! tasks that push an id back onto the queue when they fire, so every wake-up
//! goes through the same lease-guarded path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use direktiv_core::Clock;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum instances advanced at once
    pub max_concurrency: usize,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Timers an instance may have armed at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Delay, retry back-off or wait deadline
    Wake,
    /// Instance soft timeout
    Interrupt,
    /// Instance hard timeout
    Kill,
    /// Lease contention back-off
    Retry,
}

pub(crate) type ProcessFn =
    Arc<dyn Fn(Uuid) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub(crate) struct Scheduler {
    config: SchedulerConfig,
    clock: Clock,
    tx: mpsc::UnboundedSender<Uuid>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
    permits: Arc<Semaphore>,
    timers: DashMap<(Uuid, TimerKind), JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, clock: Clock) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            clock,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            timers: DashMap::new(),
            shutdown_tx,
            dispatcher: Mutex::new(None),
        }
    }

    pub fn enqueue(&self, id: Uuid) {
        if self.tx.send(id).is_err() {
            debug!(instance = %id, "run queue closed");
        }
    }

    /// Arm (or re-arm) a timer; replaces an earlier timer of the same kind
    pub fn arm(&self, id: Uuid, kind: TimerKind, at: DateTime<Utc>) {
        let delay = self.clock.until(at);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(id);
        });
        if let Some(old) = self.timers.insert((id, kind), handle) {
            old.abort();
        }
    }

    pub fn disarm(&self, id: Uuid, kind: TimerKind) {
        if let Some((_, handle)) = self.timers.remove(&(id, kind)) {
            handle.abort();
        }
    }

    pub fn disarm_all(&self, id: Uuid) {
        for kind in [
            TimerKind::Wake,
            TimerKind::Interrupt,
            TimerKind::Kill,
            TimerKind::Retry,
        ] {
            self.disarm(id, kind);
        }
    }

    pub fn armed(&self) -> usize {
        self.timers.len()
    }

    /// Start the dispatcher; a second call is a no-op
    pub fn start(&self, process: ProcessFn) {
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };
        let permits = Arc::clone(&self.permits);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(max_concurrency = self.config.max_concurrency, "starting instance scheduler");
        let handle = tokio::spawn(async move {
            loop {
                let id = tokio::select! {
                    next = rx.recv() => match next {
                        Some(id) => id,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };
                let permit = tokio::select! {
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };
                let process = Arc::clone(&process);
                tokio::spawn(async move {
                    process(id).await;
                    drop(permit);
                });
            }
            debug!("scheduler dispatcher stopped");
        });
        *self.dispatcher.lock() = Some(handle);
    }

    /// Stop dispatching and wait for in-flight work
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while self.permits.available_permits() < self.config.max_concurrency {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.config.max_concurrency - self.permits.available_permits(),
                    "scheduler shutdown timeout reached"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for entry in self.timers.iter() {
            entry.value().abort();
        }
        self.timers.clear();
        info!("instance scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>) -> ProcessFn {
        Arc::new(move |_id| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_paused_time() {
        let clock = Clock::new();
        let start = clock.now();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        let elapsed = clock.now() - start;
        assert!(elapsed >= chrono::Duration::seconds(3600));
        assert_eq!(clock.until(start), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_enqueued_ids_are_processed() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), Clock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.start(counting(Arc::clone(&counter)));

        for _ in 0..5 {
            scheduler.enqueue(Uuid::new_v4());
        }
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_and_rearm_replaces() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), Clock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.start(counting(Arc::clone(&counter)));

        let id = Uuid::new_v4();
        let clock = Clock::new();
        scheduler.arm(id, TimerKind::Wake, clock.now() + chrono::Duration::seconds(10));
        scheduler.arm(id, TimerKind::Wake, clock.now() + chrono::Duration::seconds(20));
        assert_eq!(scheduler.armed(), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_timer() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), Clock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.start(counting(Arc::clone(&counter)));

        let id = Uuid::new_v4();
        scheduler.arm(id, TimerKind::Kill, Clock::new().now() + chrono::Duration::seconds(1));
        scheduler.disarm_all(id);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        scheduler.shutdown().await;
    }
}

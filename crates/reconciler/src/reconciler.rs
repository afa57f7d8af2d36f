//! Reconcile cycle
//!
//! The desired list is swapped in wholesale; a cycle reads one snapshot of
//! it, lists the runtime, and applies creates, then updates, then deletes.
//! A failing item is recorded in the report and the cycle moves on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use direktiv_core::FunctionsBackend;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ReconcileError;
use crate::runtime::{LogStream, PodInfo, RuntimeClient, RuntimeService};
use crate::service::{service_id, ServiceDefinition, ServiceType};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub backend: FunctionsBackend,
    pub knative_namespace: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            backend: FunctionsBackend::Memory,
            knative_namespace: "direktiv-services-direktiv".to_string(),
        }
    }
}

impl ReconcilerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_backend(mut self, backend: FunctionsBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_knative_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.knative_namespace = namespace.into();
        self
    }
}

/// Work computed for one cycle
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Plan {
    pub create: Vec<ServiceDefinition>,
    pub update: Vec<ServiceDefinition>,
    pub delete: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    /// Diff by id; the value hash only decides updates
    pub fn compute(desired: &[ServiceDefinition], actual: &[RuntimeService]) -> Self {
        let actual: HashMap<&str, &RuntimeService> =
            actual.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut wanted: HashMap<String, &ServiceDefinition> = HashMap::new();
        for d in desired {
            wanted.insert(d.id(), d);
        }

        let mut plan = Plan::default();
        let mut ids: Vec<&String> = wanted.keys().collect();
        ids.sort();
        for id in ids {
            let def = wanted[id];
            match actual.get(id.as_str()) {
                None => plan.create.push(def.clone()),
                Some(running) if running.value_hash != def.value_hash() => {
                    plan.update.push(def.clone())
                }
                Some(_) => {}
            }
        }
        let mut deletes: Vec<String> = actual
            .keys()
            .filter(|id| !wanted.contains_key(**id))
            .map(|id| id.to_string())
            .collect();
        deletes.sort();
        plan.delete = deletes;
        plan
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub id: String,
    pub operation: Operation,
    pub error: String,
}

/// Outcome of one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub started_at: DateTime<Utc>,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub errors: Vec<ItemError>,
}

/// Filter for [`Reconciler::list`]
#[derive(Debug, Clone, Default)]
pub struct ServiceFilter {
    pub namespace: Option<String>,
    pub typ: Option<ServiceType>,
    pub path: Option<String>,
}

/// A desired service joined with what the runtime reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: String,
    #[serde(flatten)]
    pub definition: ServiceDefinition,
    pub url: String,
    pub ready: bool,
    /// Present in the runtime with the current value hash
    pub in_sync: bool,
    pub error: Option<String>,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    runtime: Arc<dyn RuntimeClient>,
    desired: ArcSwap<Vec<ServiceDefinition>>,
    last_report: RwLock<Option<ReconcileReport>>,
    /// Last failure per id, cleared on success
    failures: RwLock<HashMap<String, String>>,
    cycle_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, runtime: Arc<dyn RuntimeClient>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            runtime,
            desired: ArcSwap::from_pointee(Vec::new()),
            last_report: RwLock::new(None),
            failures: RwLock::new(HashMap::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            shutdown_tx,
            handle: Mutex::new(None),
        })
    }

    /// Replace the desired list and schedule a cycle
    pub fn set_desired(&self, mut desired: Vec<ServiceDefinition>) {
        desired.sort_by_key(|d| d.id());
        desired.dedup_by_key(|d| d.id());
        debug!(count = desired.len(), "desired services replaced");
        self.desired.store(Arc::new(desired));
        self.wake.notify_one();
    }

    pub fn desired(&self) -> Arc<Vec<ServiceDefinition>> {
        self.desired.load_full()
    }

    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report.read().clone()
    }

    /// Run one cycle now
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let _cycle = self.cycle_lock.lock().await;
        let started_at = Utc::now();
        let desired = self.desired.load_full();
        let actual = self.runtime.list().await?;
        let plan = Plan::compute(&desired, &actual);

        let mut report = ReconcileReport {
            started_at,
            created: vec![],
            updated: vec![],
            deleted: vec![],
            errors: vec![],
        };
        if plan.is_empty() {
            debug!("runtime in sync");
        }

        for def in &plan.create {
            let id = def.id();
            match self.runtime.create(def).await {
                Ok(()) => report.created.push(id),
                Err(e) => report.errors.push(item_error(id, Operation::Create, e)),
            }
        }
        for def in &plan.update {
            let id = def.id();
            match self.runtime.update(def).await {
                Ok(()) => report.updated.push(id),
                Err(e) => report.errors.push(item_error(id, Operation::Update, e)),
            }
        }
        for id in &plan.delete {
            match self.runtime.delete(id).await {
                Ok(()) | Err(ReconcileError::NotFound(_)) => report.deleted.push(id.clone()),
                Err(e) => report.errors.push(item_error(id.clone(), Operation::Delete, e)),
            }
        }

        {
            let mut failures = self.failures.write();
            for id in report.created.iter().chain(&report.updated).chain(&report.deleted) {
                failures.remove(id);
            }
            for e in &report.errors {
                failures.insert(e.id.clone(), e.error.clone());
            }
        }
        if !plan.is_empty() {
            info!(
                created = report.created.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                errors = report.errors.len(),
                "reconcile cycle finished"
            );
        }
        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    /// Spawn the periodic loop; also runs whenever the desired list changes
    pub fn start(self: &Arc<Self>) {
        let reconciler = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.config.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = reconciler.wake.notified() => {}
                    _ = shutdown_rx.changed() => {
                        debug!("reconciler shutting down");
                        break;
                    }
                }
                if let Err(e) = reconciler.reconcile().await {
                    error!(error = %e, "reconcile cycle failed");
                }
            }
        });
        *self.handle.lock() = Some(handle);
        info!(interval = ?self.config.interval, backend = ?self.config.backend, "reconciler started");
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // ========================================================================
    // Read API
    // ========================================================================

    /// URL of a service computed from its declaration site
    pub fn service_url(&self, namespace: &str, typ: ServiceType, path: &str, name: &str) -> String {
        let id = service_id(namespace, name, typ, path);
        crate::service::service_url(self.config.backend, &self.config.knative_namespace, &id)
    }

    pub async fn list(&self, filter: &ServiceFilter) -> Result<Vec<ServiceStatus>, ReconcileError> {
        let actual: HashMap<String, RuntimeService> = match self.runtime.list().await {
            Ok(list) => list.into_iter().map(|s| (s.id.clone(), s)).collect(),
            Err(e) => {
                warn!(error = %e, "runtime listing failed, reporting desired state only");
                HashMap::new()
            }
        };
        let failures = self.failures.read().clone();

        Ok(self
            .desired()
            .iter()
            .filter(|d| filter.namespace.as_ref().map_or(true, |n| *n == d.namespace))
            .filter(|d| filter.typ.map_or(true, |t| t == d.typ))
            .filter(|d| filter.path.as_ref().map_or(true, |p| *p == d.path))
            .map(|d| {
                let id = d.id();
                let running = actual.get(&id);
                ServiceStatus {
                    url: self.runtime.url(&id),
                    ready: running.is_some_and(|r| r.ready),
                    in_sync: running.is_some_and(|r| r.value_hash == d.value_hash()),
                    error: failures
                        .get(&id)
                        .cloned()
                        .or_else(|| running.and_then(|r| r.message.clone())),
                    id,
                    definition: d.clone(),
                }
            })
            .collect())
    }

    pub async fn get(&self, namespace: &str, id: &str) -> Result<ServiceStatus, ReconcileError> {
        let filter = ServiceFilter {
            namespace: Some(namespace.to_string()),
            ..Default::default()
        };
        self.list(&filter)
            .await?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| ReconcileError::NotFound(id.to_string()))
    }

    pub async fn pods(&self, namespace: &str, id: &str) -> Result<Vec<PodInfo>, ReconcileError> {
        self.ensure_owned(namespace, id)?;
        self.runtime.pods(id).await
    }

    pub async fn logs(&self, namespace: &str, id: &str, pod: &str) -> Result<LogStream, ReconcileError> {
        self.ensure_owned(namespace, id)?;
        self.runtime.logs(id, pod).await
    }

    pub async fn kill_pod(&self, namespace: &str, id: &str, pod: &str) -> Result<(), ReconcileError> {
        self.ensure_owned(namespace, id)?;
        info!(%namespace, %id, %pod, "killing pod");
        self.runtime.kill_pod(id, pod).await
    }

    fn ensure_owned(&self, namespace: &str, id: &str) -> Result<(), ReconcileError> {
        if self
            .desired
            .load()
            .iter()
            .any(|d| d.namespace == namespace && d.id() == id)
        {
            Ok(())
        } else {
            Err(ReconcileError::NotFound(id.to_string()))
        }
    }
}

fn item_error(id: String, operation: Operation, e: ReconcileError) -> ItemError {
    warn!(%id, ?operation, error = %e, "reconcile item failed");
    ItemError {
        id,
        operation,
        error: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRuntime;
    use crate::service::ServiceSize;

    fn def(path: &str, image: &str) -> ServiceDefinition {
        ServiceDefinition {
            namespace: "ns".into(),
            typ: ServiceType::Namespace,
            path: path.into(),
            name: String::new(),
            image: image.into(),
            cmd: String::new(),
            size: ServiceSize::Small,
            scale: 1,
            envs: vec![],
        }
    }

    fn setup() -> (Arc<MemoryRuntime>, Arc<Reconciler>) {
        let runtime = Arc::new(MemoryRuntime::new());
        let reconciler = Reconciler::new(ReconcilerConfig::default(), runtime.clone());
        (runtime, reconciler)
    }

    #[test]
    fn test_plan_by_id_and_hash() {
        let a = def("/a.yaml", "img:1");
        let b = def("/b.yaml", "img:1");
        let c = def("/c.yaml", "img:1");
        let actual = vec![
            RuntimeService {
                id: b.id(),
                value_hash: "stale".into(),
                ready: true,
                message: None,
            },
            RuntimeService {
                id: c.id(),
                value_hash: c.value_hash(),
                ready: true,
                message: None,
            },
            RuntimeService {
                id: "obj-orphan".into(),
                value_hash: "x".into(),
                ready: true,
                message: None,
            },
        ];
        let plan = Plan::compute(&[a.clone(), b.clone(), c], &actual);
        assert_eq!(plan.create, vec![a]);
        assert_eq!(plan.update, vec![b]);
        assert_eq!(plan.delete, vec!["obj-orphan".to_string()]);
    }

    #[tokio::test]
    async fn test_cycle_converges() {
        let (runtime, r) = setup();
        runtime.insert(def("/gone.yaml", "img:1"));
        runtime.insert(def("/b.yaml", "img:1"));
        r.set_desired(vec![def("/a.yaml", "img:1"), def("/b.yaml", "img:2")]);

        let report = r.reconcile().await.unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.deleted.len(), 1);
        assert!(report.errors.is_empty());

        // A second cycle without outside changes has nothing to do
        let again = r.reconcile().await.unwrap();
        assert!(again.created.is_empty() && again.updated.is_empty() && again.deleted.is_empty());
        assert_eq!(runtime.get(&def("/b.yaml", "").id()).unwrap().image, "img:2");
    }

    #[tokio::test]
    async fn test_item_failure_does_not_abort_cycle() {
        let (runtime, r) = setup();
        let bad = def("/bad.yaml", "img");
        let good = def("/good.yaml", "img");
        runtime.fail_on(&bad.id());
        r.set_desired(vec![bad.clone(), good.clone()]);

        let report = r.reconcile().await.unwrap();
        assert_eq!(report.created, vec![good.id()]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].operation, Operation::Create);

        let status = r.get("ns", &bad.id()).await.unwrap();
        assert!(status.error.is_some());
        assert!(!status.in_sync);

        runtime.heal(&bad.id());
        r.reconcile().await.unwrap();
        let status = r.get("ns", &bad.id()).await.unwrap();
        assert!(status.error.is_none());
        assert!(status.in_sync);
    }

    #[tokio::test]
    async fn test_read_api_scoped_to_namespace() {
        let (_, r) = setup();
        let d = def("/svc.yaml", "img");
        r.set_desired(vec![d.clone()]);
        r.reconcile().await.unwrap();

        let list = r
            .list(&ServiceFilter {
                namespace: Some("ns".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].ready);

        let pods = r.pods("ns", &d.id()).await.unwrap();
        assert_eq!(pods.len(), 1);
        r.kill_pod("ns", &d.id(), &pods[0].name).await.unwrap();
        assert!(matches!(
            r.pods("other", &d.id()).await,
            Err(ReconcileError::NotFound(_))
        ));
    }

    #[test]
    fn test_service_url_matches_id() {
        let (_, r) = setup();
        let d = def("/svc.yaml", "img");
        assert_eq!(
            r.service_url("ns", ServiceType::Namespace, "/svc.yaml", ""),
            format!("memory://{}", d.id())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_on_desired_change() {
        let (runtime, r) = setup();
        r.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let d = def("/svc.yaml", "img");
        r.set_desired(vec![d.clone()]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(runtime.get(&d.id()).is_some());
        r.shutdown().await;
    }
}

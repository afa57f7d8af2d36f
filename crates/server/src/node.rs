// Node assembly
// Decision: Derived state (routes, triggers, desired services) is rebuilt from the file tree, never patched
// Decision: Cron evaluation and reconcile cycles run only on the leader

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use direktiv_cluster::{
    Bus, BusMessage, Cache, CacheConfig, CacheManager, LeaderConfig, LeaderElector, Subscription,
};
use direktiv_core::file::normalize_path;
use direktiv_core::manifest::ServiceFile;
use direktiv_core::workflow::FunctionKind;
use direktiv_core::{Config, FileKind, FunctionsBackend, Namespace, Workflow};
use direktiv_engine::{
    Engine, EngineConfig, FunctionCall, FunctionInvoker, HttpInvoker, NoRuntime, UrlResolver,
};
use direktiv_gateway::{EngineBackend, Gateway, GatewayConfig};
use direktiv_reconciler::{
    Reconciler, ReconcilerConfig, RuntimeClient, ServiceDefinition, ServiceType,
};
use direktiv_storage::Storage;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{ApiError, ApiResult};

/// Bus topic announcing that a namespace's files changed
pub const FILES_TOPIC: &str = "filesystem";

/// How long a namespace lookup stays cached
const NAMESPACE_TTL: Duration = Duration::from_secs(30);

const CRON_INTERVAL: Duration = Duration::from_secs(1);

/// Everything one flow node runs
pub struct Node {
    pub config: Config,
    pub storage: Storage,
    pub engine: Engine,
    pub gateway: Arc<Gateway>,
    pub reconciler: Arc<Reconciler>,
    pub caches: CacheManager,
    namespaces: Cache,
    bus: Option<Bus>,
    leader: LeaderElector,
    subscription: Mutex<Option<Subscription>>,
}

impl Node {
    /// Wire the components; nothing runs until [`Node::start`]
    pub fn build(
        config: Config,
        storage: Storage,
        bus: Option<Bus>,
        runtime: Arc<dyn RuntimeClient>,
    ) -> ApiResult<Arc<Self>> {
        let node_name = bus
            .as_ref()
            .map(|b| b.node_name().to_string())
            .unwrap_or_else(|| config.pod_name.clone());

        let reconciler = Reconciler::new(
            ReconcilerConfig::default()
                .with_interval(config.reconcile_interval)
                .with_backend(config.functions_backend)
                .with_knative_namespace(config.knative_namespace.clone()),
            runtime,
        );

        let invoker: Arc<dyn FunctionInvoker> = match config.functions_backend {
            FunctionsBackend::Memory => Arc::new(NoRuntime),
            _ => Arc::new(HttpInvoker::new(url_resolver(reconciler.clone()))),
        };
        let engine = Engine::new(
            EngineConfig::new(node_name).with_workers(config.engine_workers),
            storage.clone(),
            invoker,
        );
        let gateway = Arc::new(Gateway::new(
            GatewayConfig::default(),
            Arc::new(EngineBackend::new(engine.clone())),
        ));

        let caches = match &bus {
            Some(bus) => {
                engine.bind(bus.clone())?;
                CacheManager::clustered(bus.clone(), CacheConfig::default())?
            }
            None => CacheManager::local(CacheConfig::default()),
        };
        let namespaces = caches.cache("namespaces")?;
        let leader = LeaderElector::new(
            LeaderConfig::new(config.pod_name.clone()),
            storage.leases.clone(),
        );

        Ok(Arc::new(Self {
            config,
            storage,
            engine,
            gateway,
            reconciler,
            caches,
            namespaces,
            bus,
            leader,
            subscription: Mutex::new(None),
        }))
    }

    /// Single process node over in-memory stores
    pub fn memory(config: Config) -> ApiResult<Arc<Self>> {
        Self::build(
            config,
            Storage::memory(),
            None,
            Arc::new(direktiv_reconciler::MemoryRuntime::new()),
        )
    }

    pub fn bus(&self) -> Option<&Bus> {
        self.bus.as_ref()
    }

    /// Start workers and leader tasks, then derive state for every namespace
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> ApiResult<()> {
        self.engine.start();
        self.caches.start_gc();

        if let Some(bus) = &self.bus {
            let weak = Arc::downgrade(self);
            let subscription = bus.subscribe_per_instance(
                FILES_TOPIC,
                FILES_TOPIC,
                Arc::new(move |message: BusMessage| on_files_message(&weak, message)),
            )?;
            *self.subscription.lock() = Some(subscription);
        }

        let engine = self.engine.clone();
        self.leader.register("cron", CRON_INTERVAL, move || {
            let engine = engine.clone();
            async move {
                let started = engine.cron_tick().await;
                if started > 0 {
                    debug!(started, "scheduled workflows started");
                }
            }
        });
        let reconciler = self.reconciler.clone();
        self.leader
            .register("reconcile", self.config.reconcile_interval, move || {
                let reconciler = reconciler.clone();
                async move {
                    if let Err(e) = reconciler.reconcile().await {
                        warn!(error = %e, "reconcile cycle failed");
                    }
                }
            });
        self.leader.start();

        for ns in self.storage.namespaces.list_namespaces().await? {
            self.refresh_local(&ns.name).await;
        }
        let adopted = self.engine.recover().await?;
        info!(adopted, "node started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        self.leader.shutdown().await;
        self.engine.shutdown().await;
        self.caches.shutdown().await;
        if let Some(bus) = &self.bus {
            bus.shutdown().await;
        }
    }

    // ========================================================================
    // Namespaces
    // ========================================================================

    /// Namespace by name, served from the cluster cache when possible
    pub async fn namespace(&self, name: &str) -> ApiResult<Namespace> {
        let storage = self.storage.clone();
        let fetched = self
            .namespaces
            .get_or_fetch(name, NAMESPACE_TTL, || async move {
                let ns = storage.namespaces.get_namespace(name).await?;
                serde_json::to_vec(&ns)
                    .map(Bytes::from)
                    .map_err(|e| direktiv_storage::StoreError::Serialization(e.to_string()))
            })
            .await;
        match fetched {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ApiError::Store(direktiv_storage::StoreError::Serialization(e.to_string()))),
            // re-read for the typed error
            Err(_) => Ok(self.storage.namespaces.get_namespace(name).await?),
        }
    }

    /// Drop a namespace from every node's cache and derived state
    pub async fn forget_namespace(&self, name: &str) -> ApiResult<()> {
        self.namespaces.invalidate(name).await?;
        self.files_changed(name).await;
        Ok(())
    }

    // ========================================================================
    // Derived state
    // ========================================================================

    /// Rebuild derived state here and tell the other nodes to do the same
    pub async fn files_changed(&self, namespace: &str) {
        self.refresh_local(namespace).await;
        if let Some(bus) = &self.bus {
            if let Err(e) = bus.publish(FILES_TOPIC, namespace.as_bytes().to_vec()).await {
                warn!(%namespace, error = %e, "file change not announced");
            }
        }
    }

    /// Gateway routes, start triggers and the desired service list
    #[instrument(skip(self))]
    pub async fn refresh_local(&self, namespace: &str) {
        let exists = match self.storage.namespaces.get_namespace(namespace).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                warn!(%namespace, error = %e, "namespace lookup failed");
                return;
            }
        };

        if exists {
            if let Err(e) = self.gateway.sync_namespace(namespace).await {
                warn!(%namespace, error = %e, "gateway routes not rebuilt");
            }
            if let Err(e) = self.engine.sync_triggers(namespace).await {
                warn!(%namespace, error = %e, "triggers not rebuilt");
            }
        } else {
            self.gateway.remove_namespace(namespace);
            self.engine.remove_namespace_triggers(namespace);
        }

        match self.desired_services().await {
            Ok(desired) => self.reconciler.set_desired(desired),
            Err(e) => warn!(error = %e, "desired services not rebuilt"),
        }
    }

    /// Every service declared by service files and workflow container functions
    pub async fn desired_services(&self) -> ApiResult<Vec<ServiceDefinition>> {
        let mut desired = Vec::new();
        for file in self.storage.files.list_by_kind(None, FileKind::Service).await? {
            match ServiceFile::from_yaml(&file.data) {
                Ok(service) => desired.push(ServiceDefinition::from_service_file(
                    &file.namespace,
                    &file.path,
                    &service,
                )),
                Err(e) => debug!(path = %file.path, error = %e, "skipping invalid service file"),
            }
        }
        for file in self.storage.files.list_by_kind(None, FileKind::Workflow).await? {
            if let Ok(workflow) = Workflow::from_yaml(&file.data) {
                desired.extend(ServiceDefinition::from_workflow(
                    &file.namespace,
                    &file.path,
                    &workflow,
                ));
            }
        }
        Ok(desired)
    }
}

fn on_files_message(node: &Weak<Node>, message: BusMessage) {
    let Some(node) = node.upgrade() else {
        return;
    };
    if node.bus.as_ref().is_some_and(|b| b.node_name() == message.origin) {
        return;
    }
    let Ok(namespace) = String::from_utf8(message.payload) else {
        return;
    };
    tokio::spawn(async move {
        node.refresh_local(&namespace).await;
    });
}

/// Where a container function of a running instance is served
fn url_resolver(reconciler: Arc<Reconciler>) -> UrlResolver {
    Arc::new(move |call: &FunctionCall| match call.function.kind {
        FunctionKind::Container => Some(reconciler.service_url(
            &call.namespace,
            ServiceType::Workflow,
            &call.workflow_path,
            &call.function.id,
        )),
        FunctionKind::Namespace => call.function.service.as_deref().map(|service| {
            reconciler.service_url(
                &call.namespace,
                ServiceType::Namespace,
                &normalize_path(service),
                "",
            )
        }),
        FunctionKind::Subflow => None,
    })
}

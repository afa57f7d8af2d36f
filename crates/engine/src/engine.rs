// Instance engine
// Decision: Engine is a cheap handle around Arc<EngineInner>; the correlator sink holds a Weak
// Decision: Wake-ups carry no payload across the queue; results wait in a node-local delivery map
// Decision: Cancellation is a stored flag plus a node-local hint broadcast over the bus

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use direktiv_cluster::{Bus, BusMessage, InstanceLeases, MemberState, Subscription};
use direktiv_core::file::clean_path;
use direktiv_core::workflow::MAX_SUBFLOW_DEPTH;
use direktiv_core::{
    codes, FileKind, InstanceData, InstanceLog, Invoker, ParentRef, Workflow, WorkflowError,
};
use direktiv_events::{CloudEvent, Correlator, CorrelatorConfig};
use direktiv_storage::{InstanceFilter, Storage, StoreError};
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cursor::{result_value, Outcome};
use crate::error::EngineError;
use crate::invoke::{FunctionCall, FunctionInvoker};
use crate::scheduler::{Clock, Scheduler, SchedulerConfig, TimerKind};
use crate::status::{self, StatusHub, StatusUpdate};
use crate::triggers::{CronEntry, EngineSink};

/// Bus topic for wake, cancel and status signals between nodes
pub const SIGNAL_TOPIC: &str = "instance-signal";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Node identity used for leases and cursor ownership
    pub node: String,
    pub scheduler: SchedulerConfig,
    pub events: CorrelatorConfig,
    /// How long an instance lease lives without renewal
    pub lease_ttl: Duration,
    /// Back-off before retrying an instance leased by another node
    pub contention_backoff: Duration,
    pub max_depth: u32,
    /// Default budget of an action when the state declares no timeout
    pub action_timeout: Duration,
    /// How long start-trigger and cron dedup keys are kept
    pub dedup_ttl: Duration,
    /// Store poll interval of `wait`, for instances finishing on other nodes
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node: "local".to_string(),
            scheduler: SchedulerConfig::default(),
            events: CorrelatorConfig::default(),
            lease_ttl: Duration::from_secs(60),
            contention_backoff: Duration::from_millis(500),
            max_depth: MAX_SUBFLOW_DEPTH,
            action_timeout: Duration::from_secs(15 * 60),
            dedup_ttl: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.scheduler = self.scheduler.with_max_concurrency(workers);
        self
    }

    pub fn with_events(mut self, events: CorrelatorConfig) -> Self {
        self.events = events;
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Start a workflow by path
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub namespace: String,
    pub path: String,
    pub input: Vec<u8>,
    pub invoker: Invoker,
}

impl StartRequest {
    pub fn new(namespace: impl Into<String>, path: impl Into<String>, input: Vec<u8>) -> Self {
        Self {
            namespace: namespace.into(),
            path: path.into(),
            input,
            invoker: Invoker::Api,
        }
    }

    pub fn with_invoker(mut self, invoker: Invoker) -> Self {
        self.invoker = invoker;
        self
    }
}

// ============================================================================
// Internal messages
// ============================================================================

/// Result waiting for a suspended instance on this node
#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Events {
        listener: Uuid,
        events: Vec<CloudEvent>,
        matched: Option<usize>,
    },
    EventTimeout {
        listener: Uuid,
    },
    Branch {
        step: u32,
        index: usize,
        outcome: Outcome,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
enum Signal {
    Wake { id: Uuid },
    Cancel { id: Uuid, code: String },
    Status { update: StatusUpdate },
}

// ============================================================================
// Engine
// ============================================================================

/// Handle to the instance engine; cheap to clone
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub clock: Clock,
    pub storage: Storage,
    pub correlator: Correlator,
    pub invoker: Arc<dyn FunctionInvoker>,
    pub leases: InstanceLeases,
    pub scheduler: Scheduler,
    pub status: StatusHub,
    pub deliveries: DashMap<Uuid, Vec<Delivery>>,
    /// Woken while a local worker held the lease
    pub rerun: DashSet<Uuid>,
    /// Adopted by `recover`; listeners and calls are re-issued on the next advance
    pub recovering: DashSet<Uuid>,
    /// Action ids of container calls running on this node
    pub inflight: DashSet<String>,
    pub cancels: DashMap<Uuid, String>,
    pub workflows: DashMap<Uuid, Arc<Workflow>>,
    pub crons: RwLock<HashMap<String, Vec<CronEntry>>>,
    bus: RwLock<Option<(Bus, Subscription)>>,
}

impl Engine {
    pub fn new(config: EngineConfig, storage: Storage, invoker: Arc<dyn FunctionInvoker>) -> Self {
        let clock = Clock::new();
        let inner = Arc::new_cyclic(|weak| {
            let sink = Arc::new(EngineSink::new(weak.clone()));
            EngineInner {
                correlator: Correlator::with_clock(config.events.clone(), sink, clock),
                leases: InstanceLeases::new(
                    config.node.clone(),
                    config.lease_ttl,
                    storage.leases.clone(),
                ),
                scheduler: Scheduler::new(config.scheduler.clone(), clock),
                clock,
                storage,
                invoker,
                status: StatusHub::new(),
                deliveries: DashMap::new(),
                rerun: DashSet::new(),
                recovering: DashSet::new(),
                inflight: DashSet::new(),
                cancels: DashMap::new(),
                workflows: DashMap::new(),
                crons: RwLock::new(HashMap::new()),
                bus: RwLock::new(None),
                config,
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the worker pool and the listener sweeper
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.start(Arc::new(move |id| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    Engine { inner }.process(id).await;
                }
            })
        }));
        self.inner.correlator.start_sweeper();
    }

    /// Join the cluster: events, wake-ups, cancellations and status updates
    /// then travel to every node
    pub fn bind(&self, bus: Bus) -> Result<(), EngineError> {
        self.inner.correlator.bind(bus.clone())?;
        let weak = Arc::downgrade(&self.inner);
        let node = bus.node_name().to_string();
        let subscription = bus.subscribe_per_instance(
            SIGNAL_TOPIC,
            SIGNAL_TOPIC,
            Arc::new(move |message: BusMessage| {
                if message.origin == node {
                    return;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match serde_json::from_slice::<Signal>(&message.payload) {
                    Ok(signal) => Engine { inner }.on_signal(signal),
                    Err(e) => warn!(error = %e, "dropping malformed instance signal"),
                }
            }),
        )?;
        *self.inner.bus.write() = Some((bus, subscription));
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("stopping instance engine");
        let bus = self.inner.bus.write().take();
        if let Some((_, subscription)) = bus {
            subscription.unsubscribe();
        }
        self.inner.scheduler.shutdown().await;
        self.inner.correlator.shutdown().await;
    }

    /// Adopt pending instances after a restart
    ///
    /// Instances last suspended by this node, by no node, or by a node that
    /// is no longer alive are re-enqueued; their next advance re-registers
    /// event listeners, re-issues lost calls and re-arms timers.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let alive: Option<HashSet<String>> = self.bus().map(|bus| {
            bus.nodes()
                .into_iter()
                .filter(|m| m.state == MemberState::Alive)
                .map(|m| m.name)
                .collect()
        });

        let mut adopted = 0;
        for inst in self.inner.storage.instances.list_pending().await? {
            let owner = crate::cursor::Cursor::load(&inst.cursor)
                .ok()
                .flatten()
                .and_then(|c| c.owner);
            let mine = match (&owner, &alive) {
                (None, _) => true,
                (Some(o), _) if *o == self.inner.config.node => true,
                (Some(o), Some(alive)) => !alive.contains(o),
                (Some(_), None) => true,
            };
            if !mine {
                continue;
            }
            self.inner.recovering.insert(inst.id);
            self.inner.scheduler.enqueue(inst.id);
            adopted += 1;
        }
        info!(adopted, "pending instances recovered");
        Ok(adopted)
    }

    // ========================================================================
    // Public API
    // ========================================================================

    /// Create an instance of the workflow at `path` and queue it
    #[instrument(skip(self, request), fields(namespace = %request.namespace, path = %request.path))]
    pub async fn start_instance(&self, request: StartRequest) -> Result<InstanceData, EngineError> {
        let path = clean_path(&request.path).map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        self.inner.storage.limit.check(request.input.len() as u64)?;

        let file = self
            .inner
            .storage
            .files
            .get_file(&request.namespace, &path)
            .await?;
        if file.kind != FileKind::Workflow {
            return Err(EngineError::NotAWorkflow(path));
        }
        let workflow =
            Workflow::from_yaml(&file.data).map_err(|e| EngineError::InvalidWorkflow {
                path: path.clone(),
                message: e.to_string(),
            })?;
        self.inner.workflows.insert(file.revision, Arc::new(workflow));

        let instance = InstanceData::new(
            &request.namespace,
            &path,
            file.revision,
            request.invoker,
            request.input,
        );
        self.create(instance).await
    }

    /// Start and wait up to `timeout` for the instance to finish
    pub async fn run(
        &self,
        request: StartRequest,
        timeout: Duration,
    ) -> Result<InstanceData, EngineError> {
        let instance = self.start_instance(request).await?;
        self.wait(instance.id, timeout).await
    }

    /// Wait until the instance is terminal or `timeout` elapses; returns the
    /// latest stored copy either way
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Result<InstanceData, EngineError> {
        let updates = self.watch(id).await?;
        futures::pin_mut!(updates);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll = tokio::time::interval(self.inner.config.poll_interval);
        let mut streaming = true;

        loop {
            tokio::select! {
                update = updates.next(), if streaming => match update {
                    Some(u) if u.is_terminal() => break,
                    Some(_) => {}
                    None => streaming = false,
                },
                _ = poll.tick() => {
                    let inst = self.get(id).await?;
                    if inst.is_terminal() {
                        return Ok(inst);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        self.get(id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<InstanceData, EngineError> {
        match self.inner.storage.instances.get_instance(id).await {
            Ok(inst) => Ok(inst),
            Err(StoreError::NotFound(_)) => Err(EngineError::InstanceNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Instance in a namespace; other namespaces report not found
    pub async fn get_in(&self, namespace: &str, id: Uuid) -> Result<InstanceData, EngineError> {
        let inst = self.get(id).await?;
        if inst.namespace != namespace {
            return Err(EngineError::InstanceNotFound(id));
        }
        Ok(inst)
    }

    pub async fn list(
        &self,
        namespace: &str,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceData>, EngineError> {
        Ok(self
            .inner
            .storage
            .instances
            .list_instances(namespace, filter)
            .await?)
    }

    pub async fn logs(&self, id: Uuid) -> Result<Vec<InstanceLog>, EngineError> {
        Ok(self.inner.storage.logs.list_logs(id).await?)
    }

    /// Monotonic status updates ending with the terminal one
    pub async fn watch(
        &self,
        id: Uuid,
    ) -> Result<impl Stream<Item = StatusUpdate> + Send + 'static, EngineError> {
        let inst = self.get(id).await?;
        let rx = self.inner.status.subscribe(StatusUpdate::of(&inst));
        Ok(status::updates(rx))
    }

    /// Request cancellation; observed at the next state boundary
    pub async fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        self.cancel_with(id, codes::CANCELLED_API).await
    }

    pub(crate) async fn cancel_with(&self, id: Uuid, code: &str) -> Result<(), EngineError> {
        let inst = self.get(id).await?;
        if inst.is_terminal() {
            return Err(EngineError::Finished(id));
        }
        if !self.inner.storage.instances.request_cancel(id, code).await? {
            debug!(instance = %id, "cancellation already requested");
        }
        self.inner
            .cancels
            .entry(id)
            .or_insert_with(|| code.to_string());
        self.signal(Signal::Cancel {
            id,
            code: code.to_string(),
        });
        self.inner.scheduler.enqueue(id);
        Ok(())
    }

    /// Queue an instance for advancement on this node
    pub fn wake(&self, id: Uuid) {
        self.inner.scheduler.enqueue(id);
    }

    /// Publish an event into a namespace
    pub async fn broadcast(&self, namespace: &str, event: CloudEvent) -> Result<(), EngineError> {
        Ok(self.inner.correlator.broadcast(namespace, event).await?)
    }

    // ========================================================================
    // Worker entry
    // ========================================================================

    async fn process(&self, id: Uuid) {
        let lease = match self.inner.leases.try_acquire(id).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                if self.inner.leases.is_held_locally(id) {
                    self.inner.rerun.insert(id);
                    // The holder may have released between the two checks
                    if !self.inner.leases.is_held_locally(id)
                        && self.inner.rerun.remove(&id).is_some()
                    {
                        self.inner.scheduler.enqueue(id);
                    }
                } else {
                    self.retry_later(id);
                }
                return;
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "instance lease unavailable");
                self.retry_later(id);
                return;
            }
        };

        match lease.hold(self.advance(id)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => error!(instance = %id, error = %e, "advancing instance failed"),
            None => {
                // The new holder owns the instance now; only the local slot is ours to free
                drop(lease);
                self.inner.rerun.remove(&id);
                return;
            }
        }
        lease.release().await;

        if self.inner.rerun.remove(&id).is_some() {
            self.inner.scheduler.enqueue(id);
        }
    }

    fn retry_later(&self, id: Uuid) {
        let backoff = chrono::Duration::from_std(self.inner.config.contention_backoff)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(500));
        self.inner
            .scheduler
            .arm(id, TimerKind::Retry, self.now() + backoff);
    }

    // ========================================================================
    // Shared helpers for the state machine
    // ========================================================================

    pub(crate) async fn create(&self, instance: InstanceData) -> Result<InstanceData, EngineError> {
        self.inner.storage.instances.create_instance(&instance).await?;
        self.log(
            &instance,
            None,
            format!(
                "instance created by {} for {}",
                instance.invoker, instance.workflow_path
            ),
        )
        .await;
        self.publish(&instance);
        self.inner.scheduler.enqueue(instance.id);
        Ok(instance)
    }

    /// Create a subflow instance linked to `parent`
    pub(crate) async fn create_child(
        &self,
        parent: &InstanceData,
        path: &str,
        input: Vec<u8>,
        link: Option<ParentRef>,
    ) -> Result<InstanceData, WorkflowError> {
        let depth = parent.depth + 1;
        if depth > self.inner.config.max_depth {
            return Err(WorkflowError::uncatchable(
                codes::LIMITS_DEPTH,
                format!("subflow depth limit {} exceeded", self.inner.config.max_depth),
            ));
        }
        let file = self
            .inner
            .storage
            .files
            .get_file(&parent.namespace, path)
            .await
            .map_err(|e| WorkflowError::catchable(codes::ACTION_FAILED, format!("subflow {path}: {e}")))?;
        if file.kind != FileKind::Workflow {
            return Err(WorkflowError::catchable(
                codes::ACTION_FAILED,
                format!("subflow {path} is not a workflow"),
            ));
        }
        let mut child = InstanceData::new(
            &parent.namespace,
            path,
            file.revision,
            Invoker::Subflow,
            input,
        );
        child.depth = depth;
        if let Some(link) = link {
            child = child.with_parent(link, depth);
        }
        self.create(child)
            .await
            .map_err(|e| WorkflowError::catchable(codes::ACTION_FAILED, e.to_string()))
    }

    /// Run a container call in the background; the outcome is delivered to
    /// the branch `reply` names
    pub(crate) fn spawn_call(&self, call: FunctionCall, reply: Option<(u32, usize)>) {
        let engine = self.clone();
        let id = call.instance_id;
        let key = call.action_id.clone();
        self.inner.inflight.insert(key.clone());
        tokio::spawn(async move {
            let outcome = match engine.inner.invoker.invoke(call).await {
                Ok(value) => Outcome::Ok { value },
                Err(error) => Outcome::Err { error },
            };
            engine.inner.inflight.remove(&key);
            if let Some((step, index)) = reply {
                engine.deliver(id, Delivery::Branch {
                    step,
                    index,
                    outcome,
                });
            }
        });
    }

    pub(crate) fn deliver(&self, id: Uuid, delivery: Delivery) {
        self.inner.deliveries.entry(id).or_default().push(delivery);
        self.inner.scheduler.enqueue(id);
    }

    pub(crate) fn take_deliveries(&self, id: Uuid) -> Vec<Delivery> {
        self.inner
            .deliveries
            .remove(&id)
            .map(|(_, list)| list)
            .unwrap_or_default()
    }

    pub(crate) fn local_cancel(&self, id: Uuid) -> Option<String> {
        self.inner.cancels.get(&id).map(|c| c.value().clone())
    }

    pub(crate) async fn log(&self, instance: &InstanceData, state: Option<&str>, message: String) {
        info!(instance = %instance.id, state = state.unwrap_or(""), "{message}");
        let line = InstanceLog::info(instance.id, state, message);
        if let Err(e) = self.inner.storage.logs.append_log(&line).await {
            warn!(instance = %instance.id, error = %e, "failed to persist instance log");
        }
    }

    pub(crate) async fn log_error(
        &self,
        instance: &InstanceData,
        state: Option<&str>,
        message: String,
    ) {
        warn!(instance = %instance.id, state = state.unwrap_or(""), "{message}");
        let line = InstanceLog::error(instance.id, state, message);
        if let Err(e) = self.inner.storage.logs.append_log(&line).await {
            warn!(instance = %instance.id, error = %e, "failed to persist instance log");
        }
    }

    pub(crate) fn publish(&self, instance: &InstanceData) {
        let update = StatusUpdate::of(instance);
        self.inner.status.publish(update.clone());
        self.signal(Signal::Status { update });
    }

    fn bus(&self) -> Option<Bus> {
        self.inner.bus.read().as_ref().map(|(bus, _)| bus.clone())
    }

    fn signal(&self, signal: Signal) {
        let Some(bus) = self.bus() else {
            return;
        };
        let payload = match serde_json::to_vec(&signal) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode instance signal");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = bus.publish(SIGNAL_TOPIC, payload).await {
                warn!(error = %e, "failed to publish instance signal");
            }
        });
    }

    /// Wake an instance here and on every other node
    pub(crate) fn wake_everywhere(&self, id: Uuid) {
        self.inner.scheduler.enqueue(id);
        self.signal(Signal::Wake { id });
    }

    fn on_signal(&self, signal: Signal) {
        match signal {
            Signal::Wake { id } => self.inner.scheduler.enqueue(id),
            Signal::Cancel { id, code } => {
                self.inner.cancels.entry(id).or_insert(code);
                self.inner.scheduler.enqueue(id);
            }
            Signal::Status { update } => {
                if update.is_terminal() {
                    self.forget(update.id);
                }
                self.inner.status.publish(update);
            }
        }
    }

    /// Drop node-local bookkeeping of a finished instance
    pub(crate) fn forget(&self, id: Uuid) {
        self.inner.scheduler.disarm_all(id);
        self.inner.deliveries.remove(&id);
        self.inner.cancels.remove(&id);
        self.inner.recovering.remove(&id);
    }

    /// Parsed workflow of an instance's pinned revision
    pub(crate) async fn workflow(&self, inst: &InstanceData) -> Result<Arc<Workflow>, WorkflowError> {
        if let Some(wf) = self.inner.workflows.get(&inst.revision) {
            return Ok(Arc::clone(wf.value()));
        }
        let file = self
            .inner
            .storage
            .files
            .get_revision(&inst.namespace, &inst.workflow_path, inst.revision)
            .await
            .map_err(|e| WorkflowError::internal(format!("workflow revision unavailable: {e}")))?;
        let wf = Workflow::from_yaml(&file.data)
            .map_err(|e| WorkflowError::internal(format!("workflow is invalid: {e}")))?;
        let wf = Arc::new(wf);
        self.inner.workflows.insert(inst.revision, Arc::clone(&wf));
        Ok(wf)
    }

    /// Move an instance to its terminal status and settle everything around it
    pub(crate) async fn finalize(
        &self,
        inst: &mut InstanceData,
        result: Result<Vec<u8>, WorkflowError>,
    ) -> Result<(), EngineError> {
        let changed = match &result {
            Ok(output) => inst.complete(output.clone()),
            Err(err) => inst.fail(err),
        };
        if !changed {
            return Ok(());
        }
        self.inner.storage.instances.save_instance(inst).await?;
        self.inner
            .correlator
            .cancel_instance(&inst.namespace, inst.id);
        self.forget(inst.id);

        match &result {
            Ok(_) => self.log(inst, None, "instance completed".to_string()).await,
            Err(err) => {
                self.log_error(inst, None, format!("instance {}: {err}", inst.status))
                    .await
            }
        }
        self.publish(inst);

        // Children still running are cancelled with their parent
        match self.inner.storage.instances.list_children(inst.id).await {
            Ok(children) => {
                for child in children.into_iter().filter(|c| !c.is_terminal()) {
                    if let Err(e) = self.cancel_with(child.id, codes::CANCELLED_PARENT).await {
                        debug!(child = %child.id, error = %e, "child cancellation skipped");
                    }
                }
            }
            Err(e) => warn!(instance = %inst.id, error = %e, "failed to list children"),
        }

        if let Some(parent) = &inst.parent {
            let outcome = match result {
                Ok(output) => Outcome::Ok {
                    value: result_value(&output),
                },
                Err(err) => Outcome::Err {
                    error: child_error(err),
                },
            };
            self.inner
                .deliveries
                .entry(parent.instance_id)
                .or_default()
                .push(Delivery::Branch {
                    step: parent.step,
                    index: parent.branch,
                    outcome,
                });
            self.wake_everywhere(parent.instance_id);
        }
        Ok(())
    }
}

/// Error a parent sees for a failed subflow; only the depth limit stays uncatchable
pub(crate) fn child_error(err: WorkflowError) -> WorkflowError {
    if err.code == codes::LIMITS_DEPTH {
        err
    } else {
        WorkflowError::catchable(err.code, err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::NoRuntime;

    #[test]
    fn test_signal_wire_shape() {
        let id = Uuid::nil();
        let json = serde_json::to_value(Signal::Cancel {
            id,
            code: codes::CANCELLED_API.to_string(),
        })
        .unwrap();
        assert_eq!(json["signal"], "cancel");
        assert_eq!(json["code"], codes::CANCELLED_API);
    }

    #[tokio::test]
    async fn test_start_rejects_non_workflow() {
        let storage = Storage::memory();
        storage.namespaces.create_namespace("ns", false).await.unwrap();
        storage
            .files
            .create_file("ns", "/notes.txt", FileKind::File, "text/plain", b"hi".to_vec())
            .await
            .unwrap();
        let engine = Engine::new(EngineConfig::default(), storage, Arc::new(NoRuntime));

        let err = engine
            .start_instance(StartRequest::new("ns", "/notes.txt", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotAWorkflow(_)));

        let err = engine
            .start_instance(StartRequest::new("ns", "/missing.yaml", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_finished_instance_conflicts() {
        let storage = Storage::memory();
        storage.namespaces.create_namespace("ns", false).await.unwrap();
        let mut inst = InstanceData::new("ns", "/wf.yaml", Uuid::nil(), Invoker::Api, vec![]);
        inst.complete(b"{}".to_vec());
        storage.instances.create_instance(&inst).await.unwrap();
        let engine = Engine::new(EngineConfig::default(), storage, Arc::new(NoRuntime));

        assert!(matches!(
            engine.cancel(inst.id).await,
            Err(EngineError::Finished(_))
        ));
        assert!(matches!(
            engine.cancel(Uuid::new_v4()).await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }
}

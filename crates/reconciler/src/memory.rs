// In-memory runtime for single-node setups and tests

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;

use crate::error::ReconcileError;
use crate::runtime::{LogStream, PodInfo, RuntimeClient, RuntimeService};
use crate::service::ServiceDefinition;

#[derive(Default)]
pub struct MemoryRuntime {
    services: Mutex<BTreeMap<String, ServiceDefinition>>,
    /// Ids whose create/update/delete fail, for exercising partial failure
    failing: Mutex<HashSet<String>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.failing.lock().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<ServiceDefinition> {
        self.services.lock().get(id).cloned()
    }

    /// Place a service directly, bypassing the reconciler
    pub fn insert(&self, service: ServiceDefinition) {
        self.services.lock().insert(service.id(), service);
    }

    fn check(&self, id: &str) -> Result<(), ReconcileError> {
        if self.failing.lock().contains(id) {
            return Err(ReconcileError::Runtime {
                status: 500,
                message: format!("injected failure for {id}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for MemoryRuntime {
    async fn list(&self) -> Result<Vec<RuntimeService>, ReconcileError> {
        Ok(self
            .services
            .lock()
            .values()
            .map(|s| RuntimeService {
                id: s.id(),
                value_hash: s.value_hash(),
                ready: true,
                message: None,
            })
            .collect())
    }

    async fn create(&self, service: &ServiceDefinition) -> Result<(), ReconcileError> {
        let id = service.id();
        self.check(&id)?;
        self.services.lock().insert(id, service.clone());
        Ok(())
    }

    async fn update(&self, service: &ServiceDefinition) -> Result<(), ReconcileError> {
        let id = service.id();
        self.check(&id)?;
        let mut services = self.services.lock();
        match services.get_mut(&id) {
            Some(existing) => {
                *existing = service.clone();
                Ok(())
            }
            None => Err(ReconcileError::NotFound(id)),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), ReconcileError> {
        self.check(id)?;
        self.services
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ReconcileError::NotFound(id.to_string()))
    }

    async fn pods(&self, id: &str) -> Result<Vec<PodInfo>, ReconcileError> {
        let services = self.services.lock();
        let service = services
            .get(id)
            .ok_or_else(|| ReconcileError::NotFound(id.to_string()))?;
        Ok((0..service.scale.max(1))
            .map(|i| PodInfo {
                name: format!("{id}-{i}"),
                status: "Running".to_string(),
                started_at: None,
            })
            .collect())
    }

    async fn logs(&self, id: &str, pod: &str) -> Result<LogStream, ReconcileError> {
        let pods = self.pods(id).await?;
        if !pods.iter().any(|p| p.name == pod) {
            return Err(ReconcileError::NotFound(pod.to_string()));
        }
        let line = Bytes::from(format!("{pod}: in-memory runtime has no logs\n"));
        Ok(Box::pin(stream::iter(vec![Ok(line)])))
    }

    async fn kill_pod(&self, id: &str, pod: &str) -> Result<(), ReconcileError> {
        let pods = self.pods(id).await?;
        if pods.iter().any(|p| p.name == pod) {
            Ok(())
        } else {
            Err(ReconcileError::NotFound(pod.to_string()))
        }
    }

    fn url(&self, id: &str) -> String {
        format!("memory://{id}")
    }
}

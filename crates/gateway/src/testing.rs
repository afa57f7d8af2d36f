// Test doubles shared by the plugin unit tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use direktiv_core::{File, FileKind, InstanceData, VarOwner, Variable};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::backend::GatewayBackend;
use crate::error::PluginError;
use crate::plugin::PluginEnv;

/// Backend over plain vectors; flows are not supported
#[derive(Default)]
pub(crate) struct MockBackend {
    pub files: Mutex<Vec<File>>,
    pub variables: Mutex<Vec<Variable>>,
}

#[async_trait]
impl GatewayBackend for MockBackend {
    async fn start_flow(&self, _: &str, path: &str, _: Vec<u8>) -> Result<InstanceData, PluginError> {
        Err(PluginError::NotFound(format!("workflow {path}")))
    }

    async fn wait_flow(&self, id: Uuid, _: Duration) -> Result<InstanceData, PluginError> {
        Err(PluginError::NotFound(format!("instance {id}")))
    }

    async fn variable(&self, owner: &VarOwner, name: &str) -> Result<Variable, PluginError> {
        self.variables
            .lock()
            .iter()
            .find(|v| {
                v.meta.namespace == owner.namespace
                    && v.meta.scope == owner.scope
                    && v.meta.owner == owner.owner
                    && v.meta.name == name
            })
            .cloned()
            .ok_or_else(|| PluginError::NotFound(format!("variable {name}")))
    }

    async fn file(&self, namespace: &str, path: &str) -> Result<File, PluginError> {
        self.files
            .lock()
            .iter()
            .find(|f| f.namespace == namespace && f.path == path)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(format!("file {path}")))
    }

    async fn files(&self, namespace: &str, kind: FileKind) -> Result<Vec<File>, PluginError> {
        Ok(self
            .files
            .lock()
            .iter()
            .filter(|f| f.namespace == namespace && f.kind == kind)
            .cloned()
            .collect())
    }
}

pub(crate) fn env_for(backend: Arc<dyn GatewayBackend>) -> PluginEnv {
    PluginEnv {
        namespace: "ns".to_string(),
        system_namespace: "system".to_string(),
        endpoint: "/ep.yaml".to_string(),
        backend,
    }
}

pub(crate) fn env() -> PluginEnv {
    env_for(Arc::new(MockBackend::default()))
}

// Everything the gateway needs from the rest of the node
// Decision: Targets talk to the engine and stores in process rather than looping back through the API

use std::time::Duration;

use async_trait::async_trait;
use direktiv_core::{File, FileKind, InstanceData, Invoker, VarOwner, Variable};
use direktiv_engine::{Engine, StartRequest};
use uuid::Uuid;

use crate::error::PluginError;

#[async_trait]
pub trait GatewayBackend: Send + Sync {
    /// Create an instance of the workflow at `path`
    async fn start_flow(
        &self,
        namespace: &str,
        path: &str,
        input: Vec<u8>,
    ) -> Result<InstanceData, PluginError>;

    /// Latest copy of an instance once it is terminal or `timeout` passed
    async fn wait_flow(&self, id: Uuid, timeout: Duration) -> Result<InstanceData, PluginError>;

    async fn variable(&self, owner: &VarOwner, name: &str) -> Result<Variable, PluginError>;

    async fn file(&self, namespace: &str, path: &str) -> Result<File, PluginError>;

    /// Every file of one kind in a namespace
    async fn files(&self, namespace: &str, kind: FileKind) -> Result<Vec<File>, PluginError>;
}

/// Backend over a local engine and its storage
#[derive(Clone)]
pub struct EngineBackend {
    engine: Engine,
}

impl EngineBackend {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl GatewayBackend for EngineBackend {
    async fn start_flow(
        &self,
        namespace: &str,
        path: &str,
        input: Vec<u8>,
    ) -> Result<InstanceData, PluginError> {
        let request = StartRequest::new(namespace, path, input).with_invoker(Invoker::Gateway);
        self.engine
            .start_instance(request)
            .await
            .map_err(PluginError::backend)
    }

    async fn wait_flow(&self, id: Uuid, timeout: Duration) -> Result<InstanceData, PluginError> {
        self.engine
            .wait(id, timeout)
            .await
            .map_err(PluginError::backend)
    }

    async fn variable(&self, owner: &VarOwner, name: &str) -> Result<Variable, PluginError> {
        self.engine
            .storage()
            .variables
            .get_variable(owner, name)
            .await
            .map_err(PluginError::backend)
    }

    async fn file(&self, namespace: &str, path: &str) -> Result<File, PluginError> {
        self.engine
            .storage()
            .files
            .get_file(namespace, path)
            .await
            .map_err(PluginError::backend)
    }

    async fn files(&self, namespace: &str, kind: FileKind) -> Result<Vec<File>, PluginError> {
        self.engine
            .storage()
            .files
            .list_by_kind(Some(namespace), kind)
            .await
            .map_err(PluginError::backend)
    }
}

// Runtime client interface
// Decision: The reconciler only needs list/create/update/delete; the rest serves the read API

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::service::ServiceDefinition;

/// Label/annotation keys written on runtime objects
pub mod labels {
    pub const MANAGED: &str = "direktiv.io/managed";
    pub const VALUE_HASH: &str = "direktiv.io/input-hash";
    pub const NAMESPACE: &str = "direktiv.io/namespace";
    pub const TYPE: &str = "direktiv.io/type";
    pub const PATH: &str = "direktiv.io/path";
    pub const NAME: &str = "direktiv.io/name";
}

/// A service as observed in the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeService {
    pub id: String,
    pub value_hash: String,
    pub ready: bool,
    /// Runtime-reported problem, if any
    #[serde(default)]
    pub message: Option<String>,
}

/// One running replica of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

pub type LogStream = BoxStream<'static, Result<Bytes, ReconcileError>>;

#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Services managed by this system
    async fn list(&self) -> Result<Vec<RuntimeService>, ReconcileError>;

    async fn create(&self, service: &ServiceDefinition) -> Result<(), ReconcileError>;

    async fn update(&self, service: &ServiceDefinition) -> Result<(), ReconcileError>;

    async fn delete(&self, id: &str) -> Result<(), ReconcileError>;

    async fn pods(&self, id: &str) -> Result<Vec<PodInfo>, ReconcileError>;

    /// Follow the logs of one pod
    async fn logs(&self, id: &str, pod: &str) -> Result<LogStream, ReconcileError>;

    async fn kill_pod(&self, id: &str, pod: &str) -> Result<(), ReconcileError>;

    /// Address callers use to reach a service
    fn url(&self, id: &str) -> String;
}

//! Store trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_core::{
    File, FileKind, InstanceData, InstanceLog, InstanceStatus, Namespace, SecretMeta, VarOwner,
    Variable, VariableMeta,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Namespaces
// ============================================================================

#[async_trait]
pub trait NamespaceStore: Send + Sync {
    /// Create a namespace; an existing one is returned when `idempotent` is set
    async fn create_namespace(&self, name: &str, idempotent: bool) -> StoreResult<Namespace>;

    async fn get_namespace(&self, name: &str) -> StoreResult<Namespace>;

    /// All namespaces ordered by name
    async fn list_namespaces(&self) -> StoreResult<Vec<Namespace>>;

    /// Delete a namespace; returns whether it existed
    ///
    /// A namespace with files, variables, secrets or instances needs `recursive`.
    async fn delete_namespace(&self, name: &str, recursive: bool) -> StoreResult<bool>;
}

// ============================================================================
// File tree
// ============================================================================

/// Listing entry for a stored revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRevision {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Create a node; the parent must exist and be a directory
    async fn create_file(
        &self,
        namespace: &str,
        path: &str,
        kind: FileKind,
        mime_type: &str,
        data: Vec<u8>,
    ) -> StoreResult<File>;

    async fn get_file(&self, namespace: &str, path: &str) -> StoreResult<File>;

    /// A specific revision of a file
    async fn get_revision(&self, namespace: &str, path: &str, revision: Uuid) -> StoreResult<File>;

    /// Revisions newest first
    async fn list_revisions(&self, namespace: &str, path: &str) -> StoreResult<Vec<FileRevision>>;

    /// Immediate children of a directory ordered by path
    async fn read_dir(&self, namespace: &str, path: &str) -> StoreResult<Vec<File>>;

    /// Replace a file's content, producing a new revision
    async fn update_file(
        &self,
        namespace: &str,
        path: &str,
        mime_type: Option<&str>,
        data: Vec<u8>,
    ) -> StoreResult<File>;

    /// Move a node (and its descendants) to a new path
    async fn rename_file(&self, namespace: &str, from: &str, to: &str) -> StoreResult<File>;

    /// Delete a node; directories with children need `recursive`
    async fn delete_file(&self, namespace: &str, path: &str, recursive: bool) -> StoreResult<()>;

    /// Every file of a kind, across all namespaces when `namespace` is `None`
    async fn list_by_kind(&self, namespace: Option<&str>, kind: FileKind) -> StoreResult<Vec<File>>;
}

// ============================================================================
// Variables
// ============================================================================

/// Partial update of a variable
#[derive(Debug, Clone, Default)]
pub struct VariablePatch {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub data: Option<Vec<u8>>,
}

#[async_trait]
pub trait VariableStore: Send + Sync {
    /// Upsert by (scope, owner, name); last writer wins
    async fn set_variable(
        &self,
        owner: &VarOwner,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> StoreResult<VariableMeta>;

    async fn get_variable(&self, owner: &VarOwner, name: &str) -> StoreResult<Variable>;

    async fn get_variable_by_id(&self, namespace: &str, id: Uuid) -> StoreResult<Variable>;

    /// Metadata of every variable of an owner, ordered by name
    async fn list_variables(&self, owner: &VarOwner) -> StoreResult<Vec<VariableMeta>>;

    async fn update_variable(
        &self,
        namespace: &str,
        id: Uuid,
        patch: VariablePatch,
    ) -> StoreResult<VariableMeta>;

    async fn delete_variable(&self, namespace: &str, id: Uuid) -> StoreResult<()>;

    /// Cascade delete of everything an owner holds; returns the count removed
    async fn delete_owner_variables(&self, owner: &VarOwner) -> StoreResult<u64>;
}

// ============================================================================
// Secrets
// ============================================================================

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store a new secret; an existing name is a conflict
    async fn set_secret(&self, namespace: &str, name: &str, value: Vec<u8>)
        -> StoreResult<SecretMeta>;

    /// Opaque secret value
    async fn get_secret(&self, namespace: &str, name: &str) -> StoreResult<Vec<u8>>;

    async fn list_secrets(&self, namespace: &str) -> StoreResult<Vec<SecretMeta>>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> StoreResult<()>;
}

// ============================================================================
// Instances and logs
// ============================================================================

/// Filter for listing instances
#[derive(Debug, Clone)]
pub struct InstanceFilter {
    pub status: Option<InstanceStatus>,
    pub workflow_path: Option<String>,
    pub offset: u32,
    pub limit: u32,
}

impl Default for InstanceFilter {
    fn default() -> Self {
        Self {
            status: None,
            workflow_path: None,
            offset: 0,
            limit: 100,
        }
    }
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn create_instance(&self, instance: &InstanceData) -> StoreResult<()>;

    async fn get_instance(&self, id: Uuid) -> StoreResult<InstanceData>;

    /// Persist a checkpoint; the stored status may only move forward
    async fn save_instance(&self, instance: &InstanceData) -> StoreResult<()>;

    /// Flag a pending instance for cancellation without touching its checkpoint;
    /// false when it already finished or was flagged before
    async fn request_cancel(&self, id: Uuid, code: &str) -> StoreResult<bool>;

    /// Instances of a namespace, newest first
    async fn list_instances(
        &self,
        namespace: &str,
        filter: &InstanceFilter,
    ) -> StoreResult<Vec<InstanceData>>;

    /// Every pending instance across namespaces, oldest first
    async fn list_pending(&self) -> StoreResult<Vec<InstanceData>>;

    /// Child instances spawned by `parent`
    async fn list_children(&self, parent: Uuid) -> StoreResult<Vec<InstanceData>>;

    /// Remove terminal instances that ended before `before`, with their
    /// logs and instance-scoped variables; returns the count removed
    async fn reap_instances(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_log(&self, log: &InstanceLog) -> StoreResult<()>;

    /// Logs of an instance in append order
    async fn list_logs(&self, instance_id: Uuid) -> StoreResult<Vec<InstanceLog>>;
}

// ============================================================================
// Leases
// ============================================================================

/// Current holder of a lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub key: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take or renew a lease; succeeds when free, expired, or already held by `holder`
    async fn acquire_lease(&self, key: &str, holder: &str, ttl: std::time::Duration)
        -> StoreResult<bool>;

    /// Give up a lease held by `holder`; no-op otherwise
    async fn release_lease(&self, key: &str, holder: &str) -> StoreResult<()>;

    /// Unexpired holder of a lease
    async fn lease_holder(&self, key: &str) -> StoreResult<Option<LeaseInfo>>;
}

//! In-memory implementation of every store trait
//!
//! Used for single-node development and tests. Provides the same semantics
//! as the PostgreSQL implementation, including cascades and the size cap.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_core::file::{clean_path, is_descendant, parent_path};
use direktiv_core::{
    validate_name, File, FileKind, InstanceData, InstanceLog, Namespace, SecretMeta, VarOwner,
    VarScope, Variable, VariableMeta,
};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::cipher::SecretCipher;
use crate::error::StoreError;
use crate::parcel::{checksum, SizeLimit};
use crate::store::*;

struct StoredFile {
    file: File,
    /// Oldest first; the last entry mirrors `file`
    revisions: Vec<(Uuid, DateTime<Utc>, Vec<u8>)>,
}

struct StoredSecret {
    meta: SecretMeta,
    sealed: Vec<u8>,
}

struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    namespaces: BTreeMap<String, Namespace>,
    /// (namespace, path) -> file
    files: BTreeMap<(String, String), StoredFile>,
    variables: HashMap<Uuid, Variable>,
    secrets: BTreeMap<(String, String), StoredSecret>,
    instances: HashMap<Uuid, InstanceData>,
    logs: HashMap<Uuid, Vec<InstanceLog>>,
    leases: HashMap<String, Lease>,
}

/// In-memory store
pub struct MemoryStore {
    inner: RwLock<Inner>,
    cipher: SecretCipher,
    limit: SizeLimit,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            cipher: SecretCipher::ephemeral(),
            limit: SizeLimit::default(),
        }
    }

    pub fn with_cipher(mut self, cipher: SecretCipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_size_limit(mut self, limit: SizeLimit) -> Self {
        self.limit = limit;
        self
    }

    /// Number of stored instances
    pub fn instance_count(&self) -> usize {
        self.inner.read().instances.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn require_namespace(inner: &Inner, namespace: &str) -> Result<(), StoreError> {
    if inner.namespaces.contains_key(namespace) {
        Ok(())
    } else {
        Err(StoreError::not_found(format!("namespace '{namespace}'")))
    }
}

fn key(namespace: &str, path: &str) -> (String, String) {
    (namespace.to_string(), path.to_string())
}

fn drop_owner_variables(inner: &mut Inner, owner: &VarOwner) -> u64 {
    let before = inner.variables.len();
    inner.variables.retain(|_, v| {
        !(v.meta.namespace == owner.namespace
            && v.meta.scope == owner.scope
            && v.meta.owner == owner.owner)
    });
    (before - inner.variables.len()) as u64
}

// ============================================================================
// Namespaces
// ============================================================================

#[async_trait]
impl NamespaceStore for MemoryStore {
    async fn create_namespace(&self, name: &str, idempotent: bool) -> StoreResult<Namespace> {
        validate_name(name)?;
        let mut inner = self.inner.write();
        if let Some(existing) = inner.namespaces.get(name) {
            if idempotent {
                return Ok(existing.clone());
            }
            return Err(StoreError::Conflict(format!("namespace '{name}'")));
        }
        let ns = Namespace::new(name);
        inner.namespaces.insert(name.to_string(), ns.clone());
        Ok(ns)
    }

    async fn get_namespace(&self, name: &str) -> StoreResult<Namespace> {
        self.inner
            .read()
            .namespaces
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("namespace '{name}'")))
    }

    async fn list_namespaces(&self) -> StoreResult<Vec<Namespace>> {
        Ok(self.inner.read().namespaces.values().cloned().collect())
    }

    async fn delete_namespace(&self, name: &str, recursive: bool) -> StoreResult<bool> {
        let mut inner = self.inner.write();
        if !inner.namespaces.contains_key(name) {
            return Ok(false);
        }
        let has_children = inner.files.keys().any(|(ns, _)| ns == name)
            || inner.variables.values().any(|v| v.meta.namespace == name)
            || inner.secrets.keys().any(|(ns, _)| ns == name)
            || inner.instances.values().any(|i| i.namespace == name);
        if has_children && !recursive {
            return Err(StoreError::RecursiveRequired(format!("namespace '{name}'")));
        }

        inner.files.retain(|(ns, _), _| ns != name);
        inner.variables.retain(|_, v| v.meta.namespace != name);
        inner.secrets.retain(|(ns, _), _| ns != name);
        let dropped: Vec<Uuid> = inner
            .instances
            .values()
            .filter(|i| i.namespace == name)
            .map(|i| i.id)
            .collect();
        for id in dropped {
            inner.instances.remove(&id);
            inner.logs.remove(&id);
        }
        inner.namespaces.remove(name);
        Ok(true)
    }
}

// ============================================================================
// File tree
// ============================================================================

fn root_dir(namespace: &str) -> File {
    let mut f = File::new(namespace, "/", FileKind::Directory, "", vec![]);
    f.id = Uuid::nil();
    f.revision = Uuid::nil();
    f
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn create_file(
        &self,
        namespace: &str,
        path: &str,
        kind: FileKind,
        mime_type: &str,
        data: Vec<u8>,
    ) -> StoreResult<File> {
        let path = clean_path(path)?;
        if path == "/" {
            return Err(StoreError::Conflict("path '/'".to_string()));
        }
        let mut inner = self.inner.write();
        require_namespace(&inner, namespace)?;

        if let Some(parent) = parent_path(&path) {
            if parent != "/" {
                match inner.files.get(&key(namespace, &parent)) {
                    Some(p) if p.file.kind.is_dir() => {}
                    Some(_) => {
                        return Err(StoreError::Validation(format!(
                            "parent '{parent}' is not a directory"
                        )))
                    }
                    None => {
                        return Err(StoreError::Validation(format!(
                            "parent directory '{parent}' does not exist"
                        )))
                    }
                }
            }
        }
        if inner.files.contains_key(&key(namespace, &path)) {
            return Err(StoreError::Conflict(format!("file '{path}'")));
        }

        let mime = if mime_type.is_empty() {
            kind.default_mime()
        } else {
            mime_type
        };
        let data = if kind.is_dir() { vec![] } else { data };
        let file = File::new(namespace, &path, kind, mime, data);
        inner.files.insert(
            key(namespace, &path),
            StoredFile {
                revisions: vec![(file.revision, file.created_at, file.data.clone())],
                file: file.clone(),
            },
        );
        Ok(file)
    }

    async fn get_file(&self, namespace: &str, path: &str) -> StoreResult<File> {
        let path = clean_path(path)?;
        let inner = self.inner.read();
        require_namespace(&inner, namespace)?;
        if path == "/" {
            return Ok(root_dir(namespace));
        }
        inner
            .files
            .get(&key(namespace, &path))
            .map(|f| f.file.clone())
            .ok_or_else(|| StoreError::not_found(format!("file '{path}'")))
    }

    async fn get_revision(&self, namespace: &str, path: &str, revision: Uuid) -> StoreResult<File> {
        let path = clean_path(path)?;
        let inner = self.inner.read();
        let stored = inner
            .files
            .get(&key(namespace, &path))
            .ok_or_else(|| StoreError::not_found(format!("file '{path}'")))?;
        let (id, created_at, data) = stored
            .revisions
            .iter()
            .find(|(id, _, _)| *id == revision)
            .ok_or_else(|| StoreError::not_found(format!("revision '{revision}' of '{path}'")))?;
        let mut file = stored.file.clone();
        file.revision = *id;
        file.updated_at = *created_at;
        file.data = data.clone();
        Ok(file)
    }

    async fn list_revisions(&self, namespace: &str, path: &str) -> StoreResult<Vec<FileRevision>> {
        let path = clean_path(path)?;
        let inner = self.inner.read();
        let stored = inner
            .files
            .get(&key(namespace, &path))
            .ok_or_else(|| StoreError::not_found(format!("file '{path}'")))?;
        Ok(stored
            .revisions
            .iter()
            .rev()
            .map(|(id, created_at, _)| FileRevision {
                id: *id,
                created_at: *created_at,
            })
            .collect())
    }

    async fn read_dir(&self, namespace: &str, path: &str) -> StoreResult<Vec<File>> {
        let path = clean_path(path)?;
        let inner = self.inner.read();
        require_namespace(&inner, namespace)?;
        if path != "/" {
            match inner.files.get(&key(namespace, &path)) {
                Some(f) if f.file.kind.is_dir() => {}
                Some(_) => {
                    return Err(StoreError::Validation(format!("'{path}' is not a directory")))
                }
                None => return Err(StoreError::not_found(format!("file '{path}'"))),
            }
        }
        Ok(inner
            .files
            .iter()
            .filter(|((ns, p), _)| ns == namespace && parent_path(p).as_deref() == Some(&path))
            .map(|(_, f)| f.file.clone())
            .collect())
    }

    async fn update_file(
        &self,
        namespace: &str,
        path: &str,
        mime_type: Option<&str>,
        data: Vec<u8>,
    ) -> StoreResult<File> {
        let path = clean_path(path)?;
        let mut inner = self.inner.write();
        let stored = inner
            .files
            .get_mut(&key(namespace, &path))
            .ok_or_else(|| StoreError::not_found(format!("file '{path}'")))?;
        if stored.file.kind.is_dir() {
            return Err(StoreError::Validation(format!("'{path}' is a directory")));
        }
        let now = Utc::now();
        stored.file.revision = Uuid::now_v7();
        stored.file.data = data;
        stored.file.updated_at = now;
        if let Some(mime) = mime_type.filter(|m| !m.is_empty()) {
            stored.file.mime_type = mime.to_string();
        }
        stored
            .revisions
            .push((stored.file.revision, now, stored.file.data.clone()));
        Ok(stored.file.clone())
    }

    async fn rename_file(&self, namespace: &str, from: &str, to: &str) -> StoreResult<File> {
        let from = clean_path(from)?;
        let to = clean_path(to)?;
        if from == "/" || to == "/" {
            return Err(StoreError::Validation("cannot move the root directory".to_string()));
        }
        if is_descendant(&to, &from) {
            return Err(StoreError::Validation(format!(
                "cannot move '{from}' into itself"
            )));
        }
        let mut inner = self.inner.write();
        if !inner.files.contains_key(&key(namespace, &from)) {
            return Err(StoreError::not_found(format!("file '{from}'")));
        }
        if inner.files.contains_key(&key(namespace, &to)) {
            return Err(StoreError::Conflict(format!("file '{to}'")));
        }
        if let Some(parent) = parent_path(&to) {
            if parent != "/" {
                match inner.files.get(&key(namespace, &parent)) {
                    Some(p) if p.file.kind.is_dir() => {}
                    _ => {
                        return Err(StoreError::Validation(format!(
                            "parent directory '{parent}' does not exist"
                        )))
                    }
                }
            }
        }

        let moving: Vec<String> = inner
            .files
            .keys()
            .filter(|(ns, p)| ns == namespace && (*p == from || is_descendant(p, &from)))
            .map(|(_, p)| p.clone())
            .collect();
        let now = Utc::now();
        for old in moving {
            if let Some(mut stored) = inner.files.remove(&key(namespace, &old)) {
                let new_path = format!("{to}{}", &old[from.len()..]);
                stored.file.path = new_path.clone();
                stored.file.updated_at = now;
                if stored.file.kind == FileKind::Workflow {
                    for v in inner.variables.values_mut() {
                        if v.meta.namespace == namespace
                            && v.meta.scope == VarScope::Workflow
                            && v.meta.owner == old
                        {
                            v.meta.owner = new_path.clone();
                        }
                    }
                }
                inner.files.insert(key(namespace, &new_path), stored);
            }
        }
        inner
            .files
            .get(&key(namespace, &to))
            .map(|f| f.file.clone())
            .ok_or_else(|| StoreError::not_found(format!("file '{to}'")))
    }

    async fn delete_file(&self, namespace: &str, path: &str, recursive: bool) -> StoreResult<()> {
        let path = clean_path(path)?;
        if path == "/" {
            return Err(StoreError::Validation("cannot delete the root directory".to_string()));
        }
        let mut inner = self.inner.write();
        let stored = inner
            .files
            .get(&key(namespace, &path))
            .ok_or_else(|| StoreError::not_found(format!("file '{path}'")))?;
        let is_dir = stored.file.kind.is_dir();
        let victims: Vec<(String, FileKind)> = inner
            .files
            .iter()
            .filter(|((ns, p), _)| ns == namespace && (*p == path || is_descendant(p, &path)))
            .map(|((_, p), f)| (p.clone(), f.file.kind))
            .collect();
        if is_dir && victims.len() > 1 && !recursive {
            return Err(StoreError::RecursiveRequired(format!("directory '{path}'")));
        }
        for (p, kind) in victims {
            inner.files.remove(&key(namespace, &p));
            if kind == FileKind::Workflow {
                drop_owner_variables(&mut inner, &VarOwner::workflow(namespace, &p));
            }
        }
        Ok(())
    }

    async fn list_by_kind(&self, namespace: Option<&str>, kind: FileKind) -> StoreResult<Vec<File>> {
        Ok(self
            .inner
            .read()
            .files
            .iter()
            .filter(|((ns, _), f)| namespace.map_or(true, |n| n == ns) && f.file.kind == kind)
            .map(|(_, f)| f.file.clone())
            .collect())
    }
}

// ============================================================================
// Variables
// ============================================================================

#[async_trait]
impl VariableStore for MemoryStore {
    async fn set_variable(
        &self,
        owner: &VarOwner,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> StoreResult<VariableMeta> {
        validate_name(name)?;
        self.limit.check(data.len() as u64)?;
        let mut inner = self.inner.write();
        require_namespace(&inner, &owner.namespace)?;

        let now = Utc::now();
        let sum = checksum(&data);
        if let Some(existing) = inner.variables.values_mut().find(|v| {
            v.meta.namespace == owner.namespace
                && v.meta.scope == owner.scope
                && v.meta.owner == owner.owner
                && v.meta.name == name
        }) {
            existing.meta.size = data.len() as u64;
            existing.meta.mime_type = mime_type.to_string();
            existing.meta.checksum = sum;
            existing.meta.updated_at = now;
            existing.data = data;
            return Ok(existing.meta.clone());
        }

        let meta = VariableMeta {
            id: Uuid::now_v7(),
            namespace: owner.namespace.clone(),
            scope: owner.scope,
            owner: owner.owner.clone(),
            name: name.to_string(),
            size: data.len() as u64,
            mime_type: mime_type.to_string(),
            checksum: sum,
            created_at: now,
            updated_at: now,
        };
        inner.variables.insert(
            meta.id,
            Variable {
                meta: meta.clone(),
                data,
            },
        );
        Ok(meta)
    }

    async fn get_variable(&self, owner: &VarOwner, name: &str) -> StoreResult<Variable> {
        let var = self
            .inner
            .read()
            .variables
            .values()
            .find(|v| {
                v.meta.namespace == owner.namespace
                    && v.meta.scope == owner.scope
                    && v.meta.owner == owner.owner
                    && v.meta.name == name
            })
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("variable '{name}'")))?;
        self.limit.check(var.meta.size)?;
        Ok(var)
    }

    async fn get_variable_by_id(&self, namespace: &str, id: Uuid) -> StoreResult<Variable> {
        let var = self
            .inner
            .read()
            .variables
            .get(&id)
            .filter(|v| v.meta.namespace == namespace)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("variable '{id}'")))?;
        self.limit.check(var.meta.size)?;
        Ok(var)
    }

    async fn list_variables(&self, owner: &VarOwner) -> StoreResult<Vec<VariableMeta>> {
        let mut list: Vec<VariableMeta> = self
            .inner
            .read()
            .variables
            .values()
            .filter(|v| {
                v.meta.namespace == owner.namespace
                    && v.meta.scope == owner.scope
                    && v.meta.owner == owner.owner
            })
            .map(|v| v.meta.clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn update_variable(
        &self,
        namespace: &str,
        id: Uuid,
        patch: VariablePatch,
    ) -> StoreResult<VariableMeta> {
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(data) = &patch.data {
            self.limit.check(data.len() as u64)?;
        }
        let mut inner = self.inner.write();
        let (scope, owner) = match inner.variables.get(&id) {
            Some(v) if v.meta.namespace == namespace => (v.meta.scope, v.meta.owner.clone()),
            _ => return Err(StoreError::not_found(format!("variable '{id}'"))),
        };
        if let Some(name) = &patch.name {
            let taken = inner.variables.values().any(|v| {
                v.meta.id != id
                    && v.meta.namespace == namespace
                    && v.meta.scope == scope
                    && v.meta.owner == owner
                    && &v.meta.name == name
            });
            if taken {
                return Err(StoreError::Conflict(format!("variable '{name}'")));
            }
        }
        let var = inner
            .variables
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("variable '{id}'")))?;
        if let Some(name) = patch.name {
            var.meta.name = name;
        }
        if let Some(mime) = patch.mime_type {
            var.meta.mime_type = mime;
        }
        if let Some(data) = patch.data {
            var.meta.size = data.len() as u64;
            var.meta.checksum = checksum(&data);
            var.data = data;
        }
        var.meta.updated_at = Utc::now();
        Ok(var.meta.clone())
    }

    async fn delete_variable(&self, namespace: &str, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write();
        match inner.variables.get(&id) {
            Some(v) if v.meta.namespace == namespace => {
                inner.variables.remove(&id);
                Ok(())
            }
            _ => Err(StoreError::not_found(format!("variable '{id}'"))),
        }
    }

    async fn delete_owner_variables(&self, owner: &VarOwner) -> StoreResult<u64> {
        Ok(drop_owner_variables(&mut self.inner.write(), owner))
    }
}

// ============================================================================
// Secrets
// ============================================================================

#[async_trait]
impl SecretStore for MemoryStore {
    async fn set_secret(
        &self,
        namespace: &str,
        name: &str,
        value: Vec<u8>,
    ) -> StoreResult<SecretMeta> {
        validate_name(name)?;
        let sealed = self.cipher.seal(&value)?;
        let mut inner = self.inner.write();
        require_namespace(&inner, namespace)?;
        if inner.secrets.contains_key(&key(namespace, name)) {
            return Err(StoreError::Conflict(format!("secret '{name}'")));
        }
        let now = Utc::now();
        let meta = SecretMeta {
            namespace: namespace.to_string(),
            name: name.to_string(),
            initialized: true,
            created_at: now,
            updated_at: now,
        };
        inner.secrets.insert(
            key(namespace, name),
            StoredSecret {
                meta: meta.clone(),
                sealed,
            },
        );
        Ok(meta)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> StoreResult<Vec<u8>> {
        let sealed = self
            .inner
            .read()
            .secrets
            .get(&key(namespace, name))
            .map(|s| s.sealed.clone())
            .ok_or_else(|| StoreError::not_found(format!("secret '{name}'")))?;
        self.cipher.open(&sealed)
    }

    async fn list_secrets(&self, namespace: &str) -> StoreResult<Vec<SecretMeta>> {
        Ok(self
            .inner
            .read()
            .secrets
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, s)| s.meta.clone())
            .collect())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.inner
            .write()
            .secrets
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("secret '{name}'")))
    }
}

// ============================================================================
// Instances and logs
// ============================================================================

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn create_instance(&self, instance: &InstanceData) -> StoreResult<()> {
        let mut inner = self.inner.write();
        require_namespace(&inner, &instance.namespace)?;
        if inner.instances.contains_key(&instance.id) {
            return Err(StoreError::Conflict(format!("instance '{}'", instance.id)));
        }
        inner.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> StoreResult<InstanceData> {
        self.inner
            .read()
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("instance '{id}'")))
    }

    async fn save_instance(&self, instance: &InstanceData) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| StoreError::not_found(format!("instance '{}'", instance.id)))?;
        if stored.status.is_terminal() && stored.status != instance.status {
            return Err(StoreError::Conflict(format!(
                "instance '{}' is already {}",
                instance.id, stored.status
            )));
        }
        // A cancellation recorded meanwhile survives a checkpoint taken without it
        let cancel = (stored.cancel_requested && !instance.cancel_requested)
            .then(|| stored.cancel_code.clone());
        *stored = instance.clone();
        if let Some(code) = cancel {
            stored.cancel_requested = true;
            stored.cancel_code = code;
        }
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid, code: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write();
        let stored = inner
            .instances
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("instance '{id}'")))?;
        if stored.is_terminal() || stored.cancel_requested {
            return Ok(false);
        }
        stored.request_cancel(code);
        Ok(true)
    }

    async fn list_instances(
        &self,
        namespace: &str,
        filter: &InstanceFilter,
    ) -> StoreResult<Vec<InstanceData>> {
        let inner = self.inner.read();
        let mut list: Vec<InstanceData> = inner
            .instances
            .values()
            .filter(|i| i.namespace == namespace)
            .filter(|i| filter.status.map_or(true, |s| s == i.status))
            .filter(|i| {
                filter
                    .workflow_path
                    .as_deref()
                    .map_or(true, |p| p == i.workflow_path)
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(list
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn list_pending(&self) -> StoreResult<Vec<InstanceData>> {
        let mut list: Vec<InstanceData> = self
            .inner
            .read()
            .instances
            .values()
            .filter(|i| !i.is_terminal())
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn list_children(&self, parent: Uuid) -> StoreResult<Vec<InstanceData>> {
        Ok(self
            .inner
            .read()
            .instances
            .values()
            .filter(|i| i.parent.as_ref().is_some_and(|p| p.instance_id == parent))
            .cloned()
            .collect())
    }

    async fn reap_instances(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write();
        let victims: Vec<(Uuid, String)> = inner
            .instances
            .values()
            .filter(|i| i.is_terminal() && i.ended_at.is_some_and(|t| t < before))
            .map(|i| (i.id, i.namespace.clone()))
            .collect();
        for (id, ns) in &victims {
            inner.instances.remove(id);
            inner.logs.remove(id);
            drop_owner_variables(&mut inner, &VarOwner::instance(ns, *id));
        }
        Ok(victims.len() as u64)
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append_log(&self, log: &InstanceLog) -> StoreResult<()> {
        self.inner
            .write()
            .logs
            .entry(log.instance_id)
            .or_default()
            .push(log.clone());
        Ok(())
    }

    async fn list_logs(&self, instance_id: Uuid) -> StoreResult<Vec<InstanceLog>> {
        Ok(self
            .inner
            .read()
            .logs
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Leases
// ============================================================================

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let mut inner = self.inner.write();
        match inner.leases.get_mut(key) {
            Some(lease) if lease.holder != holder && lease.expires_at > now => Ok(false),
            Some(lease) => {
                lease.holder = holder.to_string();
                lease.expires_at = expires_at;
                Ok(true)
            }
            None => {
                inner.leases.insert(
                    key.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, key: &str, holder: &str) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if inner.leases.get(key).is_some_and(|l| l.holder == holder) {
            inner.leases.remove(key);
        }
        Ok(())
    }

    async fn lease_holder(&self, key: &str) -> StoreResult<Option<LeaseInfo>> {
        let now = Utc::now();
        Ok(self
            .inner
            .read()
            .leases
            .get(key)
            .filter(|l| l.expires_at > now)
            .map(|l| LeaseInfo {
                key: key.to_string(),
                holder: l.holder.clone(),
                expires_at: l.expires_at,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use direktiv_core::{InstanceStatus, Invoker, WorkflowError};

    async fn store_with_ns() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_namespace("test", false).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_namespace_boundaries() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.create_namespace("Bad_Name", false).await,
            Err(StoreError::Validation(_))
        ));
        store.create_namespace("a", false).await.unwrap();
        assert!(matches!(
            store.create_namespace("a", false).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(store.create_namespace("a", true).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_non_empty_namespace_requires_recursive() {
        let store = store_with_ns().await;
        store
            .create_file("test", "/wf.yaml", FileKind::Workflow, "", b"x".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            store.delete_namespace("test", false).await,
            Err(StoreError::RecursiveRequired(_))
        ));
        assert!(store.delete_namespace("test", true).await.unwrap());
        assert!(!store.delete_namespace("test", true).await.unwrap());
        assert!(store.list_by_kind(None, FileKind::Workflow).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_tree_parents() {
        let store = store_with_ns().await;
        let err = store
            .create_file("test", "/a/b.yaml", FileKind::File, "", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        store
            .create_file("test", "/a", FileKind::Directory, "", vec![])
            .await
            .unwrap();
        store
            .create_file("test", "/a/b.yaml", FileKind::File, "text/plain", b"hi".to_vec())
            .await
            .unwrap();
        let children = store.read_dir("test", "/a").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].path, "/a/b.yaml");

        let root = store.read_dir("test", "/").await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(store.get_file("test", "/").await.unwrap().kind, FileKind::Directory);

        assert!(matches!(
            store.delete_file("test", "/a", false).await,
            Err(StoreError::RecursiveRequired(_))
        ));
        store.delete_file("test", "/a", true).await.unwrap();
        assert!(store.get_file("test", "/a/b.yaml").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_workflow_revisions() {
        let store = store_with_ns().await;
        let v1 = store
            .create_file("test", "/wf.yaml", FileKind::Workflow, "", b"one".to_vec())
            .await
            .unwrap();
        let v2 = store
            .update_file("test", "/wf.yaml", None, b"two".to_vec())
            .await
            .unwrap();
        assert_ne!(v1.revision, v2.revision);
        assert_eq!(store.get_file("test", "/wf.yaml").await.unwrap().data, b"two");
        let old = store.get_revision("test", "/wf.yaml", v1.revision).await.unwrap();
        assert_eq!(old.data, b"one");
        let revs = store.list_revisions("test", "/wf.yaml").await.unwrap();
        assert_eq!(revs[0].id, v2.revision);
    }

    #[tokio::test]
    async fn test_rename_moves_descendants_and_variables() {
        let store = store_with_ns().await;
        store
            .create_file("test", "/a", FileKind::Directory, "", vec![])
            .await
            .unwrap();
        store
            .create_file("test", "/a/wf.yaml", FileKind::Workflow, "", vec![])
            .await
            .unwrap();
        store
            .set_variable(&VarOwner::workflow("test", "/a/wf.yaml"), "x", "text/plain", b"1".to_vec())
            .await
            .unwrap();
        store.rename_file("test", "/a", "/b").await.unwrap();
        assert!(store.get_file("test", "/b/wf.yaml").await.is_ok());
        let var = store
            .get_variable(&VarOwner::workflow("test", "/b/wf.yaml"), "x")
            .await
            .unwrap();
        assert_eq!(var.data, b"1");
    }

    #[tokio::test]
    async fn test_variable_set_get_last_writer_wins() {
        let store = store_with_ns().await;
        let owner = VarOwner::namespace("test");
        let first = store.set_variable(&owner, "v", "text/plain", b"1".to_vec()).await.unwrap();
        let second = store.set_variable(&owner, "v", "text/plain", b"22".to_vec()).await.unwrap();
        assert_eq!(first.id, second.id);
        let got = store.get_variable(&owner, "v").await.unwrap();
        assert_eq!(got.data, b"22");
        assert_eq!(got.meta.size, 2);
        assert_eq!(got.meta.checksum, checksum(b"22"));
    }

    #[tokio::test]
    async fn test_variables_listed_by_name() {
        let store = store_with_ns().await;
        let owner = VarOwner::namespace("test");
        for name in ["c", "a", "b"] {
            store.set_variable(&owner, name, "", vec![]).await.unwrap();
        }
        let names: Vec<String> = store
            .list_variables(&owner)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_variable_size_cap_on_write_and_read() {
        let store = MemoryStore::new().with_size_limit(SizeLimit::new(4));
        store.create_namespace("test", false).await.unwrap();
        let owner = VarOwner::namespace("test");
        assert!(matches!(
            store.set_variable(&owner, "big", "", vec![0; 5]).await,
            Err(StoreError::TooLarge { .. })
        ));
        store.set_variable(&owner, "ok", "", vec![0; 4]).await.unwrap();
    }

    #[tokio::test]
    async fn test_secrets_sealed_and_conflict() {
        let store = store_with_ns().await;
        store.set_secret("test", "token", b"s3cret".to_vec()).await.unwrap();
        assert!(matches!(
            store.set_secret("test", "token", b"other".to_vec()).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.get_secret("test", "token").await.unwrap(), b"s3cret");
        {
            let inner = store.inner.read();
            let stored = &inner.secrets[&key("test", "token")];
            assert_ne!(stored.sealed, b"s3cret");
        }
        store.delete_secret("test", "token").await.unwrap();
        assert!(store.get_secret("test", "token").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_terminal_instance_is_final() {
        let store = store_with_ns().await;
        let mut inst = InstanceData::new("test", "/wf.yaml", Uuid::nil(), Invoker::Api, vec![]);
        store.create_instance(&inst).await.unwrap();
        inst.complete(b"{}".to_vec());
        store.save_instance(&inst).await.unwrap();

        let mut other = inst.clone();
        other.status = InstanceStatus::Failed;
        assert!(store.save_instance(&other).await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_keeps_cancel_request() {
        let store = store_with_ns().await;
        let inst = InstanceData::new("test", "/wf.yaml", Uuid::nil(), Invoker::Api, vec![]);
        store.create_instance(&inst).await.unwrap();

        assert!(store.request_cancel(inst.id, "direktiv.cancels.api").await.unwrap());
        assert!(!store.request_cancel(inst.id, "direktiv.cancels.parent").await.unwrap());

        // A worker checkpoint taken from an older copy
        let mut stale = inst.clone();
        stale.push_flow("a");
        store.save_instance(&stale).await.unwrap();

        let stored = store.get_instance(inst.id).await.unwrap();
        assert_eq!(stored.flow, vec!["a"]);
        assert!(stored.cancel_requested);
        assert_eq!(stored.cancel_code.as_deref(), Some("direktiv.cancels.api"));
    }

    #[tokio::test]
    async fn test_reap_removes_instance_variables_and_logs() {
        let store = store_with_ns().await;
        let mut inst = InstanceData::new("test", "/wf.yaml", Uuid::nil(), Invoker::Api, vec![]);
        store.create_instance(&inst).await.unwrap();
        let owner = VarOwner::instance("test", inst.id);
        store.set_variable(&owner, "x", "", b"1".to_vec()).await.unwrap();
        store
            .append_log(&InstanceLog::info(inst.id, None, "hello"))
            .await
            .unwrap();
        inst.fail(&WorkflowError::catchable("x", "y"));
        store.save_instance(&inst).await.unwrap();

        let reaped = store
            .reap_instances(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reaped, 1);
        assert!(store.list_variables(&owner).await.unwrap().is_empty());
        assert!(store.list_logs(inst.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_expiry() {
        let store = MemoryStore::new();
        assert!(store.acquire_lease("l", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!store.acquire_lease("l", "b", Duration::from_secs(60)).await.unwrap());
        assert!(store.acquire_lease("l", "a", Duration::from_secs(60)).await.unwrap());
        store.release_lease("l", "b").await.unwrap();
        assert_eq!(store.lease_holder("l").await.unwrap().unwrap().holder, "a");
        store.release_lease("l", "a").await.unwrap();
        assert!(store.acquire_lease("l", "b", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.lease_holder("l").await.unwrap().is_none());
        assert!(store.acquire_lease("l", "a", Duration::from_secs(1)).await.unwrap());
    }
}

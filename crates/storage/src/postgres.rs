//! PostgreSQL implementation of every store trait
//!
//! Cascades ride on foreign keys (namespace -> everything, instance -> logs),
//! except workflow and instance variables whose owners are not rows of their
//! own; those are removed explicitly inside the owning transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_core::file::{clean_path, is_descendant, parent_path};
use direktiv_core::{
    validate_name, File, FileKind, InstanceData, InstanceLog, InstanceStatus, Namespace,
    SecretMeta, VarOwner, VarScope, Variable, VariableMeta,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::cipher::SecretCipher;
use crate::error::StoreError;
use crate::parcel::{checksum, SizeLimit};
use crate::store::*;

/// PostgreSQL-backed store
///
/// ```ignore
/// let store = PostgresStore::connect("postgres://localhost/direktiv").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    cipher: SecretCipher,
    limit: SizeLimit,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cipher: SecretCipher::ephemeral(),
            limit: SizeLimit::default(),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(url)
            .await
            .map_err(db_err("connect"))?;
        info!("connected to postgres");
        Ok(Self::new(pool))
    }

    pub fn with_cipher(mut self, cipher: SecretCipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_size_limit(mut self, limit: SizeLimit) -> Self {
        self.limit = limit;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migrate: {e}")))
    }
}

fn db_err(op: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        if let Some(db) = e.as_database_error() {
            if db.code().as_deref() == Some("23505") {
                return StoreError::Conflict(op.to_string());
            }
        }
        error!(op, "database error: {}", e);
        StoreError::Database(e.to_string())
    }
}

fn namespace_from_row(row: &PgRow) -> Namespace {
    Namespace {
        id: row.get("id"),
        name: row.get("name"),
        config: row.get("config"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn file_from_row(row: &PgRow) -> Result<File, StoreError> {
    let kind: String = row.get("kind");
    Ok(File {
        id: row.get("id"),
        namespace: row.get("namespace"),
        path: row.get("path"),
        kind: kind.parse().map_err(StoreError::Serialization)?,
        mime_type: row.get("mime_type"),
        data: row.get("data"),
        revision: row.get("revision"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn meta_from_row(row: &PgRow) -> Result<VariableMeta, StoreError> {
    let scope: String = row.get("scope");
    let size: i64 = row.get("size");
    Ok(VariableMeta {
        id: row.get("id"),
        namespace: row.get("namespace"),
        scope: scope.parse().map_err(StoreError::Serialization)?,
        owner: row.get("owner"),
        name: row.get("name"),
        size: size as u64,
        mime_type: row.get("mime_type"),
        checksum: row.get("checksum"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn instance_from_row(row: &PgRow) -> Result<InstanceData, StoreError> {
    let data: serde_json::Value = row.get("data");
    Ok(serde_json::from_value(data)?)
}

const FILE_COLUMNS: &str =
    "id, namespace, path, kind, mime_type, data, revision, created_at, updated_at";
const VAR_META_COLUMNS: &str =
    "id, namespace, scope, owner, name, size, mime_type, checksum, created_at, updated_at";

// ============================================================================
// Namespaces
// ============================================================================

#[async_trait]
impl NamespaceStore for PostgresStore {
    #[instrument(skip(self))]
    async fn create_namespace(&self, name: &str, idempotent: bool) -> StoreResult<Namespace> {
        validate_name(name)?;
        let ns = Namespace::new(name);
        let inserted = sqlx::query(
            r#"
            INSERT INTO namespaces (id, name, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(ns.id)
        .bind(&ns.name)
        .bind(&ns.config)
        .bind(ns.created_at)
        .bind(ns.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("create namespace"))?
        .rows_affected();

        if inserted == 0 {
            if idempotent {
                return self.get_namespace(name).await;
            }
            return Err(StoreError::Conflict(format!("namespace '{name}'")));
        }
        debug!(namespace = %name, "created namespace");
        Ok(ns)
    }

    async fn get_namespace(&self, name: &str) -> StoreResult<Namespace> {
        sqlx::query("SELECT * FROM namespaces WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get namespace"))?
            .map(|r| namespace_from_row(&r))
            .ok_or_else(|| StoreError::not_found(format!("namespace '{name}'")))
    }

    async fn list_namespaces(&self) -> StoreResult<Vec<Namespace>> {
        let rows = sqlx::query("SELECT * FROM namespaces ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list namespaces"))?;
        Ok(rows.iter().map(namespace_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn delete_namespace(&self, name: &str, recursive: bool) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        let exists = sqlx::query("SELECT 1 FROM namespaces WHERE name = $1 FOR UPDATE")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("delete namespace"))?
            .is_some();
        if !exists {
            return Ok(false);
        }
        if !recursive {
            let row = sqlx::query(
                r#"
                SELECT
                    EXISTS (SELECT 1 FROM files WHERE namespace = $1)
                    OR EXISTS (SELECT 1 FROM variables WHERE namespace = $1)
                    OR EXISTS (SELECT 1 FROM secrets WHERE namespace = $1)
                    OR EXISTS (SELECT 1 FROM instances WHERE namespace = $1) AS busy
                "#,
            )
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err("delete namespace"))?;
            if row.get::<bool, _>("busy") {
                return Err(StoreError::RecursiveRequired(format!("namespace '{name}'")));
            }
        }
        sqlx::query("DELETE FROM namespaces WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(db_err("delete namespace"))?;
        tx.commit().await.map_err(db_err("commit"))?;
        debug!(namespace = %name, "deleted namespace");
        Ok(true)
    }
}

// ============================================================================
// File tree
// ============================================================================

impl PostgresStore {
    async fn require_parent_dir(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        namespace: &str,
        path: &str,
    ) -> Result<(), StoreError> {
        let Some(parent) = parent_path(path) else {
            return Ok(());
        };
        if parent == "/" {
            return Ok(());
        }
        let kind: Option<String> =
            sqlx::query("SELECT kind FROM files WHERE namespace = $1 AND path = $2")
                .bind(namespace)
                .bind(&parent)
                .fetch_optional(&mut **tx)
                .await
                .map_err(db_err("check parent"))?
                .map(|r| r.get("kind"));
        match kind.as_deref() {
            Some("directory") => Ok(()),
            Some(_) => Err(StoreError::Validation(format!(
                "parent '{parent}' is not a directory"
            ))),
            None => Err(StoreError::Validation(format!(
                "parent directory '{parent}' does not exist"
            ))),
        }
    }
}

#[async_trait]
impl FileStore for PostgresStore {
    #[instrument(skip(self, data))]
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
        self.get_namespace(namespace).await?;

        let mime = if mime_type.is_empty() {
            kind.default_mime()
        } else {
            mime_type
        };
        let data = if kind.is_dir() { vec![] } else { data };
        let file = File::new(namespace, &path, kind, mime, data);

        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        self.require_parent_dir(&mut tx, namespace, &path).await?;
        sqlx::query(
            r#"
            INSERT INTO files (id, namespace, path, kind, mime_type, data, revision, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(file.id)
        .bind(namespace)
        .bind(&path)
        .bind(kind.to_string())
        .bind(&file.mime_type)
        .bind(&file.data)
        .bind(file.revision)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match db_err("create file")(e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!("file '{path}'")),
            other => other,
        })?;
        sqlx::query(
            "INSERT INTO file_revisions (id, file_id, data, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(file.revision)
        .bind(file.id)
        .bind(&file.data)
        .bind(file.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("create revision"))?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(file)
    }

    async fn get_file(&self, namespace: &str, path: &str) -> StoreResult<File> {
        let path = clean_path(path)?;
        if path == "/" {
            self.get_namespace(namespace).await?;
            let mut root = File::new(namespace, "/", FileKind::Directory, "", vec![]);
            root.id = Uuid::nil();
            root.revision = Uuid::nil();
            return Ok(root);
        }
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE namespace = $1 AND path = $2"
        ))
        .bind(namespace)
        .bind(&path)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get file"))?
        .ok_or_else(|| StoreError::not_found(format!("file '{path}'")))?;
        file_from_row(&row)
    }

    async fn get_revision(&self, namespace: &str, path: &str, revision: Uuid) -> StoreResult<File> {
        let mut file = self.get_file(namespace, path).await?;
        let row = sqlx::query(
            "SELECT data, created_at FROM file_revisions WHERE file_id = $1 AND id = $2",
        )
        .bind(file.id)
        .bind(revision)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get revision"))?
        .ok_or_else(|| StoreError::not_found(format!("revision '{revision}' of '{path}'")))?;
        file.revision = revision;
        file.data = row.get("data");
        file.updated_at = row.get("created_at");
        Ok(file)
    }

    async fn list_revisions(&self, namespace: &str, path: &str) -> StoreResult<Vec<FileRevision>> {
        let file = self.get_file(namespace, path).await?;
        let rows = sqlx::query(
            "SELECT id, created_at FROM file_revisions WHERE file_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(file.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list revisions"))?;
        Ok(rows
            .iter()
            .map(|r| FileRevision {
                id: r.get("id"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn read_dir(&self, namespace: &str, path: &str) -> StoreResult<Vec<File>> {
        let dir = self.get_file(namespace, path).await?;
        if !dir.kind.is_dir() {
            return Err(StoreError::Validation(format!("'{}' is not a directory", dir.path)));
        }
        let prefix = if dir.path == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir.path)
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FILE_COLUMNS} FROM files
            WHERE namespace = $1 AND starts_with(path, $2) AND position('/' in substr(path, length($2) + 1)) = 0
            ORDER BY path
            "#
        ))
        .bind(namespace)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("read dir"))?;
        rows.iter().map(file_from_row).collect()
    }

    #[instrument(skip(self, data))]
    async fn update_file(
        &self,
        namespace: &str,
        path: &str,
        mime_type: Option<&str>,
        data: Vec<u8>,
    ) -> StoreResult<File> {
        let mut file = self.get_file(namespace, path).await?;
        if file.kind.is_dir() {
            return Err(StoreError::Validation(format!("'{}' is a directory", file.path)));
        }
        file.revision = Uuid::now_v7();
        file.updated_at = Utc::now();
        file.data = data;
        if let Some(mime) = mime_type.filter(|m| !m.is_empty()) {
            file.mime_type = mime.to_string();
        }

        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        sqlx::query(
            "UPDATE files SET data = $1, mime_type = $2, revision = $3, updated_at = $4 WHERE id = $5",
        )
        .bind(&file.data)
        .bind(&file.mime_type)
        .bind(file.revision)
        .bind(file.updated_at)
        .bind(file.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err("update file"))?;
        sqlx::query(
            "INSERT INTO file_revisions (id, file_id, data, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(file.revision)
        .bind(file.id)
        .bind(&file.data)
        .bind(file.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("create revision"))?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(file)
    }

    #[instrument(skip(self))]
    async fn rename_file(&self, namespace: &str, from: &str, to: &str) -> StoreResult<File> {
        let from = clean_path(from)?;
        let to = clean_path(to)?;
        if from == "/" || to == "/" {
            return Err(StoreError::Validation("cannot move the root directory".to_string()));
        }
        if is_descendant(&to, &from) {
            return Err(StoreError::Validation(format!("cannot move '{from}' into itself")));
        }
        self.get_file(namespace, &from).await?;

        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        self.require_parent_dir(&mut tx, namespace, &to).await?;
        let from_prefix = format!("{from}/");
        sqlx::query(
            r#"
            UPDATE variables SET owner = $3 || substr(owner, length($2) + 1)
            WHERE namespace = $1 AND scope = 'workflow' AND (owner = $2 OR starts_with(owner, $4))
            "#,
        )
        .bind(namespace)
        .bind(&from)
        .bind(&to)
        .bind(&from_prefix)
        .execute(&mut *tx)
        .await
        .map_err(db_err("move variables"))?;
        sqlx::query(
            r#"
            UPDATE files SET path = $3 || substr(path, length($2) + 1), updated_at = NOW()
            WHERE namespace = $1 AND (path = $2 OR starts_with(path, $4))
            "#,
        )
        .bind(namespace)
        .bind(&from)
        .bind(&to)
        .bind(&from_prefix)
        .execute(&mut *tx)
        .await
        .map_err(|e| match db_err("rename file")(e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!("file '{to}'")),
            other => other,
        })?;
        tx.commit().await.map_err(db_err("commit"))?;
        self.get_file(namespace, &to).await
    }

    #[instrument(skip(self))]
    async fn delete_file(&self, namespace: &str, path: &str, recursive: bool) -> StoreResult<()> {
        let file = self.get_file(namespace, path).await?;
        if file.path == "/" {
            return Err(StoreError::Validation("cannot delete the root directory".to_string()));
        }
        let prefix = format!("{}/", file.path);
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        if file.kind.is_dir() && !recursive {
            let children = sqlx::query(
                "SELECT 1 FROM files WHERE namespace = $1 AND starts_with(path, $2) LIMIT 1",
            )
            .bind(namespace)
            .bind(&prefix)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("delete file"))?;
            if children.is_some() {
                return Err(StoreError::RecursiveRequired(format!("directory '{}'", file.path)));
            }
        }
        sqlx::query(
            r#"
            DELETE FROM variables
            WHERE namespace = $1 AND scope = 'workflow' AND (owner = $2 OR starts_with(owner, $3))
            "#,
        )
        .bind(namespace)
        .bind(&file.path)
        .bind(&prefix)
        .execute(&mut *tx)
        .await
        .map_err(db_err("delete variables"))?;
        sqlx::query("DELETE FROM files WHERE namespace = $1 AND (path = $2 OR starts_with(path, $3))")
            .bind(namespace)
            .bind(&file.path)
            .bind(&prefix)
            .execute(&mut *tx)
            .await
            .map_err(db_err("delete file"))?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(())
    }

    async fn list_by_kind(&self, namespace: Option<&str>, kind: FileKind) -> StoreResult<Vec<File>> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE kind = $1 AND ($2::text IS NULL OR namespace = $2) ORDER BY namespace, path"
        ))
        .bind(kind.to_string())
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list files"))?;
        rows.iter().map(file_from_row).collect()
    }
}

// ============================================================================
// Variables
// ============================================================================

#[async_trait]
impl VariableStore for PostgresStore {
    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn set_variable(
        &self,
        owner: &VarOwner,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> StoreResult<VariableMeta> {
        validate_name(name)?;
        self.limit.check(data.len() as u64)?;
        self.get_namespace(&owner.namespace).await?;
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO variables (id, namespace, scope, owner, name, size, mime_type, checksum, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            ON CONFLICT (namespace, scope, owner, name) DO UPDATE
            SET size = EXCLUDED.size, mime_type = EXCLUDED.mime_type,
                checksum = EXCLUDED.checksum, data = EXCLUDED.data, updated_at = EXCLUDED.updated_at
            RETURNING {VAR_META_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(&owner.namespace)
        .bind(owner.scope.to_string())
        .bind(&owner.owner)
        .bind(name)
        .bind(data.len() as i64)
        .bind(mime_type)
        .bind(checksum(&data))
        .bind(&data)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("set variable"))?;
        meta_from_row(&row)
    }

    async fn get_variable(&self, owner: &VarOwner, name: &str) -> StoreResult<Variable> {
        let row = sqlx::query(&format!(
            "SELECT {VAR_META_COLUMNS}, data FROM variables WHERE namespace = $1 AND scope = $2 AND owner = $3 AND name = $4"
        ))
        .bind(&owner.namespace)
        .bind(owner.scope.to_string())
        .bind(&owner.owner)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get variable"))?
        .ok_or_else(|| StoreError::not_found(format!("variable '{name}'")))?;
        let meta = meta_from_row(&row)?;
        self.limit.check(meta.size)?;
        Ok(Variable {
            meta,
            data: row.get("data"),
        })
    }

    async fn get_variable_by_id(&self, namespace: &str, id: Uuid) -> StoreResult<Variable> {
        let row = sqlx::query(&format!(
            "SELECT {VAR_META_COLUMNS}, data FROM variables WHERE namespace = $1 AND id = $2"
        ))
        .bind(namespace)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get variable"))?
        .ok_or_else(|| StoreError::not_found(format!("variable '{id}'")))?;
        let meta = meta_from_row(&row)?;
        self.limit.check(meta.size)?;
        Ok(Variable {
            meta,
            data: row.get("data"),
        })
    }

    async fn list_variables(&self, owner: &VarOwner) -> StoreResult<Vec<VariableMeta>> {
        let rows = sqlx::query(&format!(
            "SELECT {VAR_META_COLUMNS} FROM variables WHERE namespace = $1 AND scope = $2 AND owner = $3 ORDER BY name"
        ))
        .bind(&owner.namespace)
        .bind(owner.scope.to_string())
        .bind(&owner.owner)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list variables"))?;
        rows.iter().map(meta_from_row).collect()
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
        let size = patch.data.as_ref().map(|d| d.len() as i64);
        let sum = patch.data.as_deref().map(checksum);
        let row = sqlx::query(&format!(
            r#"
            UPDATE variables SET
                name = COALESCE($3, name),
                mime_type = COALESCE($4, mime_type),
                data = COALESCE($5, data),
                size = COALESCE($6, size),
                checksum = COALESCE($7, checksum),
                updated_at = NOW()
            WHERE namespace = $1 AND id = $2
            RETURNING {VAR_META_COLUMNS}
            "#
        ))
        .bind(namespace)
        .bind(id)
        .bind(patch.name.as_deref())
        .bind(patch.mime_type.as_deref())
        .bind(patch.data.as_deref())
        .bind(size)
        .bind(sum)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("update variable"))?
        .ok_or_else(|| StoreError::not_found(format!("variable '{id}'")))?;
        meta_from_row(&row)
    }

    async fn delete_variable(&self, namespace: &str, id: Uuid) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM variables WHERE namespace = $1 AND id = $2")
            .bind(namespace)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete variable"))?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::not_found(format!("variable '{id}'")));
        }
        Ok(())
    }

    async fn delete_owner_variables(&self, owner: &VarOwner) -> StoreResult<u64> {
        Ok(
            sqlx::query("DELETE FROM variables WHERE namespace = $1 AND scope = $2 AND owner = $3")
                .bind(&owner.namespace)
                .bind(owner.scope.to_string())
                .bind(&owner.owner)
                .execute(&self.pool)
                .await
                .map_err(db_err("delete variables"))?
                .rows_affected(),
        )
    }
}

// ============================================================================
// Secrets
// ============================================================================

#[async_trait]
impl SecretStore for PostgresStore {
    #[instrument(skip(self, value))]
    async fn set_secret(
        &self,
        namespace: &str,
        name: &str,
        value: Vec<u8>,
    ) -> StoreResult<SecretMeta> {
        validate_name(name)?;
        self.get_namespace(namespace).await?;
        let sealed = self.cipher.seal(&value)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO secrets (namespace, name, sealed, created_at, updated_at) VALUES ($1, $2, $3, $4, $4)",
        )
        .bind(namespace)
        .bind(name)
        .bind(&sealed)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match db_err("set secret")(e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!("secret '{name}'")),
            other => other,
        })?;
        Ok(SecretMeta {
            namespace: namespace.to_string(),
            name: name.to_string(),
            initialized: true,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> StoreResult<Vec<u8>> {
        let sealed: Vec<u8> =
            sqlx::query("SELECT sealed FROM secrets WHERE namespace = $1 AND name = $2")
                .bind(namespace)
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err("get secret"))?
                .map(|r| r.get("sealed"))
                .ok_or_else(|| StoreError::not_found(format!("secret '{name}'")))?;
        self.cipher.open(&sealed)
    }

    async fn list_secrets(&self, namespace: &str) -> StoreResult<Vec<SecretMeta>> {
        let rows = sqlx::query(
            "SELECT namespace, name, created_at, updated_at FROM secrets WHERE namespace = $1 ORDER BY name",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list secrets"))?;
        Ok(rows
            .iter()
            .map(|r| SecretMeta {
                namespace: r.get("namespace"),
                name: r.get("name"),
                initialized: true,
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM secrets WHERE namespace = $1 AND name = $2")
            .bind(namespace)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete secret"))?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::not_found(format!("secret '{name}'")));
        }
        Ok(())
    }
}

// ============================================================================
// Instances and logs
// ============================================================================

#[async_trait]
impl InstanceStore for PostgresStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn create_instance(&self, instance: &InstanceData) -> StoreResult<()> {
        let data = serde_json::to_value(instance)?;
        sqlx::query(
            r#"
            INSERT INTO instances (id, namespace, workflow_path, status, parent_id, ended_at, created_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(instance.id)
        .bind(&instance.namespace)
        .bind(&instance.workflow_path)
        .bind(instance.status.to_string())
        .bind(instance.parent.as_ref().map(|p| p.instance_id))
        .bind(instance.ended_at)
        .bind(instance.created_at)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(db_err("create instance"))?;
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> StoreResult<InstanceData> {
        let row = sqlx::query("SELECT data FROM instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get instance"))?
            .ok_or_else(|| StoreError::not_found(format!("instance '{id}'")))?;
        instance_from_row(&row)
    }

    async fn save_instance(&self, instance: &InstanceData) -> StoreResult<()> {
        let data = serde_json::to_value(instance)?;
        let status = instance.status.to_string();
        let updated = sqlx::query(
            r#"
            UPDATE instances SET status = $2, ended_at = $3,
                data = CASE
                    WHEN (data->>'cancel_requested')::boolean
                         AND NOT ($4::jsonb->>'cancel_requested')::boolean
                    THEN jsonb_set(
                        jsonb_set($4::jsonb, '{cancel_requested}', 'true'::jsonb),
                        '{cancel_code}', COALESCE(data->'cancel_code', 'null'::jsonb))
                    ELSE $4::jsonb
                END
            WHERE id = $1 AND (status = 'pending' OR status = $2)
            "#,
        )
        .bind(instance.id)
        .bind(&status)
        .bind(instance.ended_at)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(db_err("save instance"))?
        .rows_affected();
        if updated == 0 {
            let current = self.get_instance(instance.id).await?;
            return Err(StoreError::Conflict(format!(
                "instance '{}' is already {}",
                instance.id, current.status
            )));
        }
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid, code: &str) -> StoreResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE instances SET data = jsonb_set(
                    jsonb_set(data, '{cancel_requested}', 'true'::jsonb),
                    '{cancel_code}', to_jsonb($2::text))
            WHERE id = $1 AND status = 'pending'
              AND NOT COALESCE((data->>'cancel_requested')::boolean, false)
            "#,
        )
        .bind(id)
        .bind(code)
        .execute(&self.pool)
        .await
        .map_err(db_err("request cancel"))?
        .rows_affected();
        if updated == 0 {
            // Distinguish a missing instance from one that cannot be cancelled
            self.get_instance(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn list_instances(
        &self,
        namespace: &str,
        filter: &InstanceFilter,
    ) -> StoreResult<Vec<InstanceData>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM instances
            WHERE namespace = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR workflow_path = $3)
            ORDER BY created_at DESC, id DESC
            OFFSET $4 LIMIT $5
            "#,
        )
        .bind(namespace)
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.workflow_path.as_deref())
        .bind(filter.offset as i64)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list instances"))?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn list_pending(&self) -> StoreResult<Vec<InstanceData>> {
        let rows = sqlx::query("SELECT data FROM instances WHERE status = $1 ORDER BY created_at, id")
            .bind(InstanceStatus::Pending.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list pending"))?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn list_children(&self, parent: Uuid) -> StoreResult<Vec<InstanceData>> {
        let rows = sqlx::query("SELECT data FROM instances WHERE parent_id = $1 ORDER BY created_at")
            .bind(parent)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list children"))?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn reap_instances(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        sqlx::query(
            r#"
            DELETE FROM variables v USING instances i
            WHERE v.scope = $1 AND v.namespace = i.namespace AND v.owner = i.id::text
              AND i.status <> 'pending' AND i.ended_at < $2
            "#,
        )
        .bind(VarScope::Instance.to_string())
        .bind(before)
        .execute(&mut *tx)
        .await
        .map_err(db_err("reap variables"))?;
        let reaped = sqlx::query("DELETE FROM instances WHERE status <> 'pending' AND ended_at < $1")
            .bind(before)
            .execute(&mut *tx)
            .await
            .map_err(db_err("reap instances"))?
            .rows_affected();
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(reaped)
    }
}

#[async_trait]
impl LogStore for PostgresStore {
    async fn append_log(&self, log: &InstanceLog) -> StoreResult<()> {
        sqlx::query("INSERT INTO instance_logs (instance_id, entry) VALUES ($1, $2)")
            .bind(log.instance_id)
            .bind(serde_json::to_value(log)?)
            .execute(&self.pool)
            .await
            .map_err(db_err("append log"))?;
        Ok(())
    }

    async fn list_logs(&self, instance_id: Uuid) -> StoreResult<Vec<InstanceLog>> {
        let rows = sqlx::query("SELECT entry FROM instance_logs WHERE instance_id = $1 ORDER BY seq")
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list logs"))?;
        rows.iter()
            .map(|r| Ok(serde_json::from_value(r.get("entry"))?))
            .collect()
    }
}

// ============================================================================
// Leases
// ============================================================================

#[async_trait]
impl LeaseStore for PostgresStore {
    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        let ttl_ms = ttl.as_millis().min(i64::MAX as u128) as i64;
        let row = sqlx::query(
            r#"
            INSERT INTO leases (key, holder, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3::double precision / 1000))
            ON CONFLICT (key) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE leases.holder = EXCLUDED.holder OR leases.expires_at <= NOW()
            RETURNING holder
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(ttl_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("acquire lease"))?;
        Ok(row.is_some())
    }

    async fn release_lease(&self, key: &str, holder: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM leases WHERE key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(db_err("release lease"))?;
        Ok(())
    }

    async fn lease_holder(&self, key: &str) -> StoreResult<Option<LeaseInfo>> {
        let row = sqlx::query(
            "SELECT key, holder, expires_at FROM leases WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("lease holder"))?;
        Ok(row.map(|r| LeaseInfo {
            key: r.get("key"),
            holder: r.get("holder"),
            expires_at: r.get("expires_at"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Option<PostgresStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PostgresStore::connect(&url).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    fn unique_ns() -> String {
        format!("t{}", Uuid::now_v7().simple())
    }

    #[tokio::test]
    async fn test_variable_round_trip_postgres() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let ns = unique_ns();
        store.create_namespace(&ns, false).await.unwrap();
        let owner = VarOwner::namespace(&ns);
        store.set_variable(&owner, "v", "text/plain", b"one".to_vec()).await.unwrap();
        store.set_variable(&owner, "v", "text/plain", b"two".to_vec()).await.unwrap();
        let var = store.get_variable(&owner, "v").await.unwrap();
        assert_eq!(var.data, b"two");
        assert_eq!(var.meta.checksum, checksum(b"two"));
        store.delete_namespace(&ns, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_tree_postgres() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let ns = unique_ns();
        store.create_namespace(&ns, false).await.unwrap();
        store
            .create_file(&ns, "/dir", FileKind::Directory, "", vec![])
            .await
            .unwrap();
        store
            .create_file(&ns, "/dir/a.yaml", FileKind::Workflow, "", b"x".to_vec())
            .await
            .unwrap();
        let listing = store.read_dir(&ns, "/").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(matches!(
            store.delete_namespace(&ns, false).await,
            Err(StoreError::RecursiveRequired(_))
        ));
        store.delete_namespace(&ns, true).await.unwrap();
    }
}

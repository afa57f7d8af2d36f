// Direktiv storage
//
// Store traits plus two back-ends:
// - MemoryStore: single process, used by tests and by nodes without DATABASE_URL
// - PostgresStore: sqlx with embedded migrations
//
// Storage bundles one trait object per concern so higher layers never name a back-end.

pub mod cipher;
pub mod error;
pub mod memory;
pub mod parcel;
pub mod postgres;
pub mod store;

use std::sync::Arc;

pub use cipher::{generate_key, SecretCipher};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use parcel::{checksum, ParcelResult, ParcelUpload, SizeLimit, INLINE_LIMIT, PARCEL_SIZE};
pub use postgres::PostgresStore;
pub use store::{
    FileRevision, FileStore, InstanceFilter, InstanceStore, LeaseInfo, LeaseStore, LogStore,
    NamespaceStore, SecretStore, StoreResult, VariablePatch, VariableStore,
};

/// Handles to every store
#[derive(Clone)]
pub struct Storage {
    pub namespaces: Arc<dyn NamespaceStore>,
    pub files: Arc<dyn FileStore>,
    pub variables: Arc<dyn VariableStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub logs: Arc<dyn LogStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub limit: SizeLimit,
}

impl Storage {
    fn from_backend<B>(backend: Arc<B>, limit: SizeLimit) -> Self
    where
        B: NamespaceStore
            + FileStore
            + VariableStore
            + SecretStore
            + InstanceStore
            + LogStore
            + LeaseStore
            + 'static,
    {
        Self {
            namespaces: backend.clone(),
            files: backend.clone(),
            variables: backend.clone(),
            secrets: backend.clone(),
            instances: backend.clone(),
            logs: backend.clone(),
            leases: backend,
            limit,
        }
    }

    /// In-memory stores with the default size cap
    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()), SizeLimit::default())
    }

    pub fn from_memory(store: MemoryStore, limit: SizeLimit) -> Self {
        Self::from_backend(Arc::new(store.with_size_limit(limit)), limit)
    }

    pub fn from_postgres(store: PostgresStore, limit: SizeLimit) -> Self {
        Self::from_backend(Arc::new(store.with_size_limit(limit)), limit)
    }

    /// PostgreSQL when a URL is given, memory otherwise
    pub async fn connect(
        database_url: Option<&str>,
        cipher: SecretCipher,
        limit: SizeLimit,
    ) -> Result<Self, StoreError> {
        match database_url {
            Some(url) => {
                let store = PostgresStore::connect(url).await?.with_cipher(cipher);
                store.migrate().await?;
                Ok(Self::from_postgres(store, limit))
            }
            None => {
                tracing::info!("DATABASE_URL not set, using in-memory storage");
                Ok(Self::from_memory(MemoryStore::new().with_cipher(cipher), limit))
            }
        }
    }
}

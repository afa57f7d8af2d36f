// Cluster errors

use direktiv_core::{Classify, ErrorKind};

/// Bus failure
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A peer could not be reached or rejected a message
    #[error("transport error: {0}")]
    Transport(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    /// The local daemon did not report ready in time
    #[error("bus did not become ready within {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("peer discovery failed: {0}")]
    Discovery(String),

    #[error("invalid bus message: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Classify for BusError {
    fn kind(&self) -> ErrorKind {
        match self {
            BusError::Subscribe(_) | BusError::Codec(_) => ErrorKind::Validation,
            _ => ErrorKind::Transport,
        }
    }
}

/// Cache failure
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache prefix '{0}'")]
    InvalidPrefix(String),

    #[error("cache prefix '{0}' already registered")]
    DuplicatePrefix(String),

    #[error("cache fetch failed: {0}")]
    Fetch(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl Classify for CacheError {
    fn kind(&self) -> ErrorKind {
        match self {
            CacheError::InvalidPrefix(_) | CacheError::DuplicatePrefix(_) => ErrorKind::Validation,
            CacheError::Fetch(_) => ErrorKind::Internal,
            CacheError::Bus(e) => e.kind(),
        }
    }
}

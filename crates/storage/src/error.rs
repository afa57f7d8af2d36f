//! Store error type

use direktiv_core::{Classify, ErrorKind};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Entity does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Entity already exists
    #[error("{0} already exists")]
    Conflict(String),

    /// Malformed input (names, paths, parents)
    #[error("invalid: {0}")]
    Validation(String),

    /// The target has children and the recursive flag was not set
    #[error("{0} is not empty, recursive delete required")]
    RecursiveRequired(String),

    /// Value exceeds the configured variable size cap
    #[error("value of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    /// Parcel stream did not match the advertised size
    #[error("parcel stream carried {received} bytes, {expected} advertised")]
    SizeMismatch { expected: u64, received: u64 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Secret sealing or opening failed
    #[error("encryption error: {0}")]
    Encryption(String),
}

impl StoreError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        StoreError::NotFound(what.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::Validation(_)
            | StoreError::RecursiveRequired(_)
            | StoreError::TooLarge { .. }
            | StoreError::SizeMismatch { .. } => ErrorKind::Validation,
            StoreError::Database(_) | StoreError::Serialization(_) | StoreError::Encryption(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<direktiv_core::namespace::InvalidName> for StoreError {
    fn from(e: direktiv_core::namespace::InvalidName) -> Self {
        StoreError::Validation(e.to_string())
    }
}

impl From<direktiv_core::file::PathError> for StoreError {
    fn from(e: direktiv_core::file::PathError) -> Self {
        StoreError::Validation(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

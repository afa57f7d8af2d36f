use direktiv_cluster::BusError;
use direktiv_core::{Classify, ErrorKind};
use direktiv_events::CorrelatorError;
use direktiv_storage::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workflow {path} is invalid: {message}")]
    InvalidWorkflow { path: String, message: String },

    #[error("{0} is not a workflow")]
    NotAWorkflow(String),

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("instance {0} already finished")]
    Finished(Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Correlator(#[from] CorrelatorError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("malformed scheduler cursor: {0}")]
    Cursor(#[from] serde_json::Error),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl Classify for EngineError {
    fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Store(e) => e.kind(),
            EngineError::Correlator(e) => e.kind(),
            EngineError::InvalidWorkflow { .. }
            | EngineError::NotAWorkflow(_)
            | EngineError::InvalidInput(_) => ErrorKind::Validation,
            EngineError::InstanceNotFound(_) => ErrorKind::NotFound,
            EngineError::Finished(_) => ErrorKind::Conflict,
            EngineError::Cursor(_) | EngineError::Bus(_) | EngineError::ShuttingDown => {
                ErrorKind::Internal
            }
        }
    }
}

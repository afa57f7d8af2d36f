use direktiv_core::{Classify, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("invalid service definition: {0}")]
    Invalid(String),

    /// The runtime answered with an error
    #[error("runtime error ({status}): {message}")]
    Runtime { status: u16, message: String },

    /// The runtime could not be reached
    #[error("runtime unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected runtime response: {0}")]
    Decode(String),
}

impl Classify for ReconcileError {
    fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::NotFound(_) => ErrorKind::NotFound,
            ReconcileError::Invalid(_) => ErrorKind::Validation,
            ReconcileError::Runtime { status: 404, .. } => ErrorKind::NotFound,
            ReconcileError::Runtime { .. } | ReconcileError::Transport(_) => ErrorKind::Transport,
            ReconcileError::Decode(_) => ErrorKind::Internal,
        }
    }
}

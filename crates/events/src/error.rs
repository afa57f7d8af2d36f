use direktiv_cluster::BusError;
use direktiv_core::{Classify, ErrorKind};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CorrelatorError {
    #[error("invalid cloud event: {0}")]
    InvalidEvent(String),

    #[error("invalid listener: {0}")]
    InvalidListener(String),

    #[error("listener {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl Classify for CorrelatorError {
    fn kind(&self) -> ErrorKind {
        match self {
            CorrelatorError::InvalidEvent(_) | CorrelatorError::InvalidListener(_) => {
                ErrorKind::Validation
            }
            CorrelatorError::NotFound(_) => ErrorKind::NotFound,
            CorrelatorError::Bus(e) => e.kind(),
        }
    }
}

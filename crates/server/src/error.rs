// API errors
// Decision: Every handler error renders the shared {"error":{code,message}} envelope

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use direktiv_cluster::{BusError, CacheError};
use direktiv_core::{Classify, ErrorKind, ErrorResponse};
use direktiv_engine::EngineError;
use direktiv_events::CorrelatorError;
use direktiv_gateway::PluginError;
use direktiv_reconciler::ReconcileError;
use direktiv_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("missing or invalid api key")]
    Unauthorized,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Events(#[from] CorrelatorError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Gateway(#[from] PluginError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }
}

impl Classify for ApiError {
    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::BadRequest(_) => ErrorKind::Validation,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::Unauthorized => ErrorKind::Forbidden,
            ApiError::Store(e) => e.kind(),
            ApiError::Engine(e) => e.kind(),
            ApiError::Events(e) => e.kind(),
            ApiError::Reconcile(e) => e.kind(),
            ApiError::Gateway(e) => e.kind(),
            ApiError::Bus(e) => e.kind(),
            ApiError::Cache(e) => e.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED.as_u16(),
                ErrorResponse::new("unauthorized", self.to_string()),
            ),
            // a non-empty namespace without the recursive flag is a bad request, not a denial
            ApiError::Store(StoreError::RecursiveRequired(_)) => (
                StatusCode::BAD_REQUEST.as_u16(),
                ErrorResponse::new(ErrorKind::Validation.code(), self.to_string()),
            ),
            other => ErrorResponse::from_error(other),
        };
        if status >= 500 {
            tracing::error!(error = %self, "request failed");
        }
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

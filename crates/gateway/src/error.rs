use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use direktiv_core::{Classify, ErrorKind, ErrorResponse};
use thiserror::Error;

/// Failure building or running a plugin
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unknown plugin type '{0}'")]
    UnknownType(String),

    #[error("plugin '{typ}' cannot be used as {phase} plugin")]
    WrongPhase { typ: String, phase: &'static str },

    #[error("invalid configuration for '{typ}': {message}")]
    Config { typ: String, message: String },

    #[error("script error: {0}")]
    Script(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{message}")]
    Backend { kind: ErrorKind, message: String },
}

impl PluginError {
    pub fn config(typ: &str, message: impl std::fmt::Display) -> Self {
        PluginError::Config {
            typ: typ.to_string(),
            message: message.to_string(),
        }
    }

    /// Wrap an error from the engine or the stores, keeping its class
    pub fn backend<E>(err: E) -> Self
    where
        E: Classify + std::fmt::Display,
    {
        PluginError::Backend {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl Classify for PluginError {
    fn kind(&self) -> ErrorKind {
        match self {
            PluginError::BadRequest(_) => ErrorKind::Validation,
            PluginError::NotFound(_) => ErrorKind::NotFound,
            PluginError::Backend { kind, .. } => *kind,
            PluginError::UnknownType(_)
            | PluginError::WrongPhase { .. }
            | PluginError::Config { .. }
            | PluginError::Script(_) => ErrorKind::Internal,
        }
    }
}

impl IntoResponse for PluginError {
    fn into_response(self) -> Response {
        let (status, body) = ErrorResponse::from_error(&self);
        envelope(status, body)
    }
}

/// Errors of the gateway's own request handling, before or around the plugins
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route for {0}")]
    NoRoute(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("endpoint {path} is misconfigured: {errors}")]
    Misconfigured { path: String, errors: String },

    #[error("request exceeded the endpoint timeout of {0}s")]
    Timeout(u64),

    #[error("request body unreadable: {0}")]
    Body(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl Classify for GatewayError {
    fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::NoRoute(_) => ErrorKind::NotFound,
            GatewayError::Body(_) => ErrorKind::Validation,
            GatewayError::Plugin(e) => e.kind(),
            GatewayError::MethodNotAllowed(_)
            | GatewayError::Misconfigured { .. }
            | GatewayError::Timeout(_) => ErrorKind::Internal,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED.as_u16(),
            GatewayError::Timeout(_) => StatusCode::REQUEST_TIMEOUT.as_u16(),
            GatewayError::Misconfigured { .. } => StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            other => other.kind().status_code(),
        };
        let code = match &self {
            GatewayError::MethodNotAllowed(_) => "method_not_allowed",
            GatewayError::Timeout(_) => "request_timeout",
            GatewayError::Misconfigured { .. } => "endpoint_misconfigured",
            other => other.kind().code(),
        };
        envelope(status, ErrorResponse::new(code, self.to_string()))
    }
}

pub(crate) fn envelope(status: u16, body: ErrorResponse) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

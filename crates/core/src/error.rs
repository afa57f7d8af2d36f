//! Error taxonomy shared by every component
//!
//! Two families live here:
//! - [`ErrorKind`] classifies failures of API-level operations (validation,
//!   not found, conflict, ...) and maps them onto HTTP status codes.
//! - [`WorkflowError`] is the typed error an instance carries. Catchable
//!   errors propagate to a matching `catch`; uncatchable ones fail the instance.

use serde::{Deserialize, Serialize};

/// Well-known workflow error codes
pub mod codes {
    /// Instance cancelled through the API
    pub const CANCELLED_API: &str = "direktiv.cancels.api";
    /// Parent instance was cancelled
    pub const CANCELLED_PARENT: &str = "direktiv.cancels.parent";
    /// Soft (interrupt) timeout, catchable
    pub const TIMEOUT_SOFT: &str = "direktiv.cancels.timeout.soft";
    /// Hard (kill) timeout
    pub const TIMEOUT_HARD: &str = "direktiv.cancels.timeout.hard";
    /// Subflow nesting too deep
    pub const LIMITS_DEPTH: &str = "direktiv.limits.depth";
    /// Generic code for invariant violations
    pub const UNCATCHABLE: &str = "direktiv.uncatchable";
    /// JQ evaluation failed
    pub const JQ: &str = "direktiv.jq.badCommand";
    /// JQ produced something other than an object where one was required
    pub const JQ_NOT_OBJECT: &str = "direktiv.jq.notObject";
    /// Schema validation failed
    pub const SCHEMA: &str = "direktiv.schema.failed";
    /// Action invocation failed at the transport level
    pub const ACTION_FAILED: &str = "direktiv.action.failed";
    /// Action timed out
    pub const ACTION_TIMEOUT: &str = "timeout.action";
    /// Event wait timed out
    pub const EVENT_TIMEOUT: &str = "timeout.event";
    /// Instance deadline reached on an external call
    pub const DEADLINE: &str = "timeout.deadline";
    /// Variable operation failed
    pub const VARIABLE: &str = "direktiv.var.failed";
    /// Referenced secret missing
    pub const SECRET_MISSING: &str = "direktiv.secrets.notFound";
}

/// Classification of an operation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input (bad names, missing headers, bad YAML)
    Validation,
    /// Missing entity
    NotFound,
    /// Duplicate without the idempotent flag
    Conflict,
    /// Denied, or a recursive flag is required
    Forbidden,
    /// Bus, cache or runtime failure after retries
    Transport,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// HTTP status code for the kind
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Forbidden => 403,
            ErrorKind::Transport => 502,
            ErrorKind::Internal => 500,
        }
    }

    /// Machine-readable code used in error envelopes
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "request_data_invalid",
            ErrorKind::NotFound => "resource_not_found",
            ErrorKind::Conflict => "resource_already_exists",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Transport => "transport_failure",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Implemented by component errors so HTTP layers can classify them uniformly
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// JSON error envelope returned by every HTTP surface
///
/// `{"error": {"code": "...", "message": "..."}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    /// Envelope for a classified error, with its HTTP status
    pub fn from_error<E>(err: &E) -> (u16, Self)
    where
        E: Classify + std::fmt::Display,
    {
        let kind = err.kind();
        (kind.status_code(), Self::new(kind.code(), err.to_string()))
    }
}

/// Typed error carried by an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowError {
    /// Error code, e.g. `validation.input` or `direktiv.cancels.api`
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Whether a `catch` block may handle this error
    #[serde(default = "default_catchable")]
    pub catchable: bool,
}

fn default_catchable() -> bool {
    true
}

impl WorkflowError {
    /// Create a catchable error
    pub fn catchable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            catchable: true,
        }
    }

    /// Create an uncatchable error
    pub fn uncatchable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            catchable: false,
        }
    }

    /// Invariant violation with the generic code
    pub fn internal(message: impl Into<String>) -> Self {
        Self::uncatchable(codes::UNCATCHABLE, message)
    }

    pub fn is_cancellation(&self) -> bool {
        self.code.starts_with("direktiv.cancels.") && self.code != codes::TIMEOUT_SOFT
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for WorkflowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ErrorKind::Validation.status_code(), 400);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::Conflict.status_code(), 409);
        assert_eq!(ErrorKind::Forbidden.status_code(), 403);
        assert_eq!(ErrorKind::Internal.status_code(), 500);
    }

    #[test]
    fn test_workflow_error_flags() {
        let e = WorkflowError::catchable("validation.input", "bad input");
        assert!(e.catchable);
        assert_eq!(e.to_string(), "validation.input: bad input");

        let e = WorkflowError::internal("broken");
        assert!(!e.catchable);
        assert_eq!(e.code, codes::UNCATCHABLE);
    }

    #[test]
    fn test_cancellation_codes() {
        assert!(WorkflowError::uncatchable(codes::CANCELLED_API, "x").is_cancellation());
        assert!(WorkflowError::uncatchable(codes::TIMEOUT_HARD, "x").is_cancellation());
        assert!(!WorkflowError::catchable(codes::TIMEOUT_SOFT, "x").is_cancellation());
        assert!(!WorkflowError::catchable("action.failed", "x").is_cancellation());
    }

    #[test]
    fn test_catchable_defaults_on_deserialize() {
        let e: WorkflowError =
            serde_json::from_str(r#"{"code":"a","message":"b"}"#).unwrap();
        assert!(e.catchable);
    }
}

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use direktiv_core::{Classify, ErrorKind, ErrorResponse};
use thiserror::Error;

pub const ERROR_CODE_HEADER: &str = "direktiv-errorcode";
pub const ERROR_MESSAGE_HEADER: &str = "direktiv-errormessage";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Classify for ExecError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExecError::BadRequest(_) | ExecError::MissingHeader(_) => ErrorKind::Validation,
            ExecError::Io(_) | ExecError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Error response with the envelope body and the error headers
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let mut response = (status, Json(ErrorResponse::new(code, message))).into_response();
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(ERROR_CODE_HEADER),
        header_value(code),
    );
    headers.insert(
        HeaderName::from_static(ERROR_MESSAGE_HEADER),
        header_value(message),
    );
    response
}

fn header_value(text: &str) -> HeaderValue {
    // Header values cannot carry control characters
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    HeaderValue::from_str(&cleaned).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

impl IntoResponse for ExecError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status =
            StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        error_response(status, kind.code(), &self.to_string())
    }
}

// API key check for /api/*
// Decision: Without DIREKTIV_API_KEY the API is open; /api/v2/status never needs a key

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "Direktiv-Api-Key";

const OPEN_PATHS: &[&str] = &["/api/v2/status"];

/// Key required on API requests, if any
#[derive(Clone, Default)]
pub struct ApiKey(pub Option<Arc<str>>);

impl ApiKey {
    pub fn new(key: Option<String>) -> Self {
        Self(key.map(Arc::from))
    }

    fn accepts(&self, presented: Option<&str>) -> bool {
        match (&self.0, presented) {
            (None, _) => true,
            (Some(expected), Some(given)) => constant_eq(expected.as_bytes(), given.as_bytes()),
            (Some(_), None) => false,
        }
    }
}

fn constant_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub async fn require_api_key(State(key): State<ApiKey>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if !path.starts_with("/api/") || OPEN_PATHS.contains(&path) {
        return next.run(request).await;
    }
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if key.accepts(presented) {
        return next.run(request).await;
    }
    debug!(%path, "api key rejected");
    ApiError::Unauthorized.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts() {
        let open = ApiKey::new(None);
        assert!(open.accepts(None));
        assert!(open.accepts(Some("anything")));

        let locked = ApiKey::new(Some("s3cret".to_string()));
        assert!(locked.accepts(Some("s3cret")));
        assert!(!locked.accepts(Some("s3cre")));
        assert!(!locked.accepts(Some("s3creT")));
        assert!(!locked.accepts(None));
    }
}

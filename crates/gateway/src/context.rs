// Request and response values passed along a plugin chain
//
// The body is read into memory once before the chain starts, so every plugin
// (webhook signature checks included) sees the original bytes.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use direktiv_core::manifest::ConsumerFile;
use direktiv_core::ErrorResponse;
use serde::Serialize;
use serde_json::{json, Value};

pub const CONSUMER_USER_HEADER: &str = "direktiv-consumer-user";
pub const CONSUMER_TAGS_HEADER: &str = "direktiv-consumer-tags";
pub const CONSUMER_GROUPS_HEADER: &str = "direktiv-consumer-groups";

/// An identity auth plugins can attach to a request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Consumer {
    pub username: String,
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
    pub tags: Vec<String>,
    pub groups: Vec<String>,
}

impl Consumer {
    /// Consumer attached by webhook auth plugins
    pub fn synthetic(username: &str) -> Self {
        Self {
            username: username.to_string(),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "Username": self.username,
            "Tags": self.tags,
            "Groups": self.groups,
        })
    }
}

impl From<ConsumerFile> for Consumer {
    fn from(file: ConsumerFile) -> Self {
        Self {
            username: file.username,
            password: file.password.filter(|p| !p.is_empty()),
            api_key: file.api_key.filter(|k| !k.is_empty()),
            tags: file.tags,
            groups: file.groups,
        }
    }
}

/// One request travelling through an endpoint's plugins
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub namespace: String,
    pub method: Method,
    /// Path below the namespace prefix, e.g. `/hello/world`
    pub path: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    /// Values of `{name}` segments of the endpoint path
    pub params: BTreeMap<String, String>,
    pub body: Bytes,
    /// Every consumer of the namespace
    pub consumers: Arc<Vec<Consumer>>,
    /// Set by the first auth plugin that recognizes the caller
    pub consumer: Option<Consumer>,
}

impl GatewayRequest {
    pub fn new(namespace: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            params: BTreeMap::new(),
            body: Bytes::new(),
            consumers: Arc::new(Vec::new()),
            consumer: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Headers as a name to comma-joined value map
    pub fn header_map(&self) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &self.headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            out.entry(canonical_header(name.as_str()))
                .and_modify(|v| {
                    v.push_str(", ");
                    v.push_str(&value);
                })
                .or_insert(value);
        }
        out
    }

    pub fn query_map(&self) -> BTreeMap<String, String> {
        self.query.iter().cloned().collect()
    }

    /// Body as JSON when it parses, as a string otherwise
    pub fn body_value(&self) -> Value {
        if self.body.is_empty() {
            return Value::Null;
        }
        serde_json::from_slice(&self.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).into_owned()))
    }
}

/// `x-hub-signature-256` becomes `X-Hub-Signature-256`
pub(crate) fn canonical_header(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str().to_ascii_lowercase().as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Response produced by a target or an inbound short-circuit
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(axum::http::header::CONTENT_TYPE, value);
        }
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn json(status: StatusCode, value: &Value) -> Self {
        Self::new(
            status,
            "application/json",
            serde_json::to_vec(value).unwrap_or_default(),
        )
    }

    /// Error envelope body
    pub fn error(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        let body = ErrorResponse::new(code, message);
        Self::new(
            status,
            "application/json",
            serde_json::to_vec(&body).unwrap_or_default(),
        )
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            self.headers.insert(name, value);
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

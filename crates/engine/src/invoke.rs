// Function invocation
// Decision: Container calls go through a trait so tests and back-ends can swap the transport
// Decision: Error headers from the sidecar become catchable workflow errors with the sent code

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_core::workflow::FunctionDefinition;
use direktiv_core::{codes, WorkflowError};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::cursor::result_value;

pub const ACTION_ID_HEADER: &str = "Direktiv-ActionID";
pub const TEMP_DIR_HEADER: &str = "Direktiv-TempDir";
pub const DEADLINE_HEADER: &str = "Direktiv-Deadline";
pub const NAMESPACE_HEADER: &str = "Direktiv-Namespace";
pub const INSTANCE_HEADER: &str = "Direktiv-InstanceID";
pub const ERROR_CODE_HEADER: &str = "direktiv-errorcode";
pub const ERROR_MESSAGE_HEADER: &str = "direktiv-errormessage";

/// One container call made by an action branch
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub namespace: String,
    pub workflow_path: String,
    pub instance_id: Uuid,
    /// Unique per instance, step and branch
    pub action_id: String,
    pub function: FunctionDefinition,
    pub input: Value,
    pub deadline: DateTime<Utc>,
}

impl FunctionCall {
    pub fn temp_dir(&self) -> String {
        format!("/mnt/shared/{}", self.action_id)
    }
}

/// Runs container functions on behalf of the engine
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, call: FunctionCall) -> Result<Value, WorkflowError>;
}

/// Maps a call to the URL of the service serving it
pub type UrlResolver = Arc<dyn Fn(&FunctionCall) -> Option<String> + Send + Sync>;

/// Posts the input to the function's service and reads the result
pub struct HttpInvoker {
    client: reqwest::Client,
    resolve: UrlResolver,
}

impl HttpInvoker {
    pub fn new(resolve: UrlResolver) -> Self {
        Self {
            client: reqwest::Client::new(),
            resolve,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl FunctionInvoker for HttpInvoker {
    #[instrument(skip(self, call), fields(function = %call.function.id, action_id = %call.action_id))]
    async fn invoke(&self, call: FunctionCall) -> Result<Value, WorkflowError> {
        let url = (self.resolve)(&call).ok_or_else(|| {
            WorkflowError::catchable(
                codes::ACTION_FAILED,
                format!("function '{}' has no reachable service", call.function.id),
            )
        })?;
        let timeout = (call.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_secs(1));

        debug!(%url, "invoking function");
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header(ACTION_ID_HEADER, &call.action_id)
            .header(TEMP_DIR_HEADER, call.temp_dir())
            .header(DEADLINE_HEADER, call.deadline.to_rfc3339())
            .header(NAMESPACE_HEADER, &call.namespace)
            .header(INSTANCE_HEADER, call.instance_id.to_string())
            .json(&call.input)
            .send()
            .await
            .map_err(|e| transport_error(&call, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&call, e))?;

        if let Some(code) = header(&headers, ERROR_CODE_HEADER).filter(|c| !c.is_empty()) {
            let message = header(&headers, ERROR_MESSAGE_HEADER).unwrap_or_default();
            return Err(WorkflowError::catchable(code, message));
        }
        if !status.is_success() {
            return Err(WorkflowError::catchable(
                codes::ACTION_FAILED,
                format!(
                    "function '{}' returned {}: {}",
                    call.function.id,
                    status.as_u16(),
                    String::from_utf8_lossy(&body)
                ),
            ));
        }
        Ok(result_value(&body))
    }
}

fn header(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn transport_error(call: &FunctionCall, err: reqwest::Error) -> WorkflowError {
    if err.is_timeout() {
        WorkflowError::catchable(
            codes::ACTION_TIMEOUT,
            format!("function '{}' timed out", call.function.id),
        )
    } else {
        WorkflowError::catchable(
            codes::ACTION_FAILED,
            format!("function '{}': {err}", call.function.id),
        )
    }
}

/// Used when no function runtime is configured
pub struct NoRuntime;

#[async_trait]
impl FunctionInvoker for NoRuntime {
    async fn invoke(&self, call: FunctionCall) -> Result<Value, WorkflowError> {
        Err(WorkflowError::catchable(
            codes::ACTION_FAILED,
            format!("no function runtime configured for '{}'", call.function.id),
        ))
    }
}

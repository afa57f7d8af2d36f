// Target plugins
// Decision: Content-Type is explicit config first, then the stored mime type, then sniffing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use direktiv_core::file::normalize_path;
use direktiv_core::{InstanceData, InstanceStatus, VarOwner};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::backend::GatewayBackend;
use crate::context::{GatewayRequest, GatewayResponse};
use crate::error::PluginError;
use crate::plugin::{parse_config, PluginEnv, TargetPlugin};

pub const INSTANCE_ID_HEADER: &str = "Direktiv-Instance-Id";
pub const INSTANCE_ERROR_CODE_HEADER: &str = "Direktiv-Instance-Error-Code";
pub const INSTANCE_ERROR_MESSAGE_HEADER: &str = "Direktiv-Instance-Error-Message";

/// Upper bound of a synchronous flow call; the endpoint timeout usually ends it first
const FLOW_WAIT: Duration = Duration::from_secs(3600);

const GENERIC_MIME: &str = "application/octet-stream";

/// Best guess of a payload's mime type from its first bytes
pub(crate) fn sniff(data: &[u8]) -> &'static str {
    const MAGIC: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
    ];
    if let Some((_, mime)) = MAGIC.iter().find(|(magic, _)| data.starts_with(magic)) {
        return *mime;
    }
    let Ok(text) = std::str::from_utf8(data) else {
        return GENERIC_MIME;
    };
    let head = text.trim_start();
    let lower: String = head.chars().take(16).collect::<String>().to_ascii_lowercase();
    if lower.starts_with("<?xml") {
        "text/xml; charset=utf-8"
    } else if lower.starts_with("<!doctype html") || lower.starts_with("<html") {
        "text/html; charset=utf-8"
    } else if (head.starts_with('{') || head.starts_with('['))
        && serde_json::from_str::<Value>(text).is_ok()
    {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    }
}

fn pick_content_type(configured: Option<&str>, stored: &str, data: &[u8]) -> String {
    if let Some(ct) = configured.filter(|c| !c.is_empty()) {
        return ct.to_string();
    }
    if !stored.is_empty() && stored != GENERIC_MIME {
        return stored.to_string();
    }
    sniff(data).to_string()
}

// ============================================================================
// instant-response
// ============================================================================

fn default_status() -> u16 {
    200
}

fn default_text() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstantResponseConfig {
    #[serde(default = "default_status")]
    status_code: u16,
    #[serde(default)]
    status_message: String,
    #[serde(default = "default_text")]
    content_type: String,
}

struct InstantResponse {
    status: StatusCode,
    content_type: String,
    message: String,
}

pub fn instant_response(config: &Value, _env: &PluginEnv) -> Result<Arc<dyn TargetPlugin>, PluginError> {
    let config: InstantResponseConfig = parse_config("instant-response", config)?;
    let status = StatusCode::from_u16(config.status_code)
        .map_err(|e| PluginError::config("instant-response", e))?;
    Ok(Arc::new(InstantResponse {
        status,
        content_type: config.content_type,
        message: config.status_message,
    }))
}

#[async_trait]
impl TargetPlugin for InstantResponse {
    async fn serve(&self, _req: &GatewayRequest) -> Result<GatewayResponse, PluginError> {
        Ok(GatewayResponse::new(
            self.status,
            &self.content_type,
            self.message.clone(),
        ))
    }
}

// ============================================================================
// target-flow
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetFlowConfig {
    #[serde(default)]
    namespace: Option<String>,
    flow: String,
    /// Answer with the instance id instead of waiting for the output
    #[serde(default, rename = "async")]
    asynchronous: bool,
    #[serde(default)]
    content_type: Option<String>,
}

struct TargetFlow {
    namespace: String,
    flow: String,
    wait: bool,
    content_type: String,
    backend: Arc<dyn GatewayBackend>,
}

pub fn target_flow(config: &Value, env: &PluginEnv) -> Result<Arc<dyn TargetPlugin>, PluginError> {
    let config: TargetFlowConfig = parse_config("target-flow", config)?;
    if config.flow.trim().is_empty() {
        return Err(PluginError::config("target-flow", "flow cannot be empty"));
    }
    Ok(Arc::new(TargetFlow {
        namespace: env.target_namespace("target-flow", config.namespace.as_deref())?,
        flow: normalize_path(&config.flow),
        wait: !config.asynchronous,
        content_type: config
            .content_type
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "application/json".to_string()),
        backend: env.backend.clone(),
    }))
}

fn instance_summary(inst: &InstanceData) -> Value {
    json!({
        "id": inst.id,
        "namespace": inst.namespace,
        "path": inst.workflow_path,
        "status": inst.status,
        "createdAt": inst.created_at,
    })
}

impl TargetFlow {
    fn finished(&self, inst: InstanceData) -> GatewayResponse {
        let id = inst.id.to_string();
        let mut resp = match inst.status {
            InstanceStatus::Complete => GatewayResponse::new(
                StatusCode::OK,
                &self.content_type,
                inst.output.unwrap_or_default(),
            ),
            status if status.is_terminal() => {
                let code = inst.error_code.unwrap_or_else(|| "direktiv.unknown".to_string());
                let message = inst.error_message.unwrap_or_default();
                let mut resp =
                    GatewayResponse::error(StatusCode::INTERNAL_SERVER_ERROR, &code, message.clone());
                resp.set_header(INSTANCE_ERROR_CODE_HEADER, &code);
                resp.set_header(INSTANCE_ERROR_MESSAGE_HEADER, &message);
                resp
            }
            _ => GatewayResponse::error(
                StatusCode::GATEWAY_TIMEOUT,
                "request_timeout",
                format!("instance {id} still running"),
            ),
        };
        resp.set_header(INSTANCE_ID_HEADER, &id);
        resp
    }
}

#[async_trait]
impl TargetPlugin for TargetFlow {
    async fn serve(&self, req: &GatewayRequest) -> Result<GatewayResponse, PluginError> {
        let inst = self
            .backend
            .start_flow(&self.namespace, &self.flow, req.body.to_vec())
            .await?;
        debug!(namespace = %self.namespace, flow = %self.flow, instance_id = %inst.id, "gateway started flow");
        if !self.wait {
            let mut resp = GatewayResponse::json(StatusCode::OK, &json!({"data": instance_summary(&inst)}));
            resp.set_header(INSTANCE_ID_HEADER, &inst.id.to_string());
            return Ok(resp);
        }
        let inst = self.backend.wait_flow(inst.id, FLOW_WAIT).await?;
        Ok(self.finished(inst))
    }
}

// ============================================================================
// target-namespace-file
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NamespaceFileConfig {
    #[serde(default)]
    namespace: Option<String>,
    file: String,
    #[serde(default)]
    content_type: Option<String>,
}

struct NamespaceFile {
    namespace: String,
    path: String,
    content_type: Option<String>,
    backend: Arc<dyn GatewayBackend>,
}

pub fn namespace_file(config: &Value, env: &PluginEnv) -> Result<Arc<dyn TargetPlugin>, PluginError> {
    let config: NamespaceFileConfig = parse_config("target-namespace-file", config)?;
    if config.file.trim().is_empty() {
        return Err(PluginError::config("target-namespace-file", "file cannot be empty"));
    }
    Ok(Arc::new(NamespaceFile {
        namespace: env.target_namespace("target-namespace-file", config.namespace.as_deref())?,
        path: normalize_path(&config.file),
        content_type: config.content_type,
        backend: env.backend.clone(),
    }))
}

#[async_trait]
impl TargetPlugin for NamespaceFile {
    async fn serve(&self, _req: &GatewayRequest) -> Result<GatewayResponse, PluginError> {
        let file = self.backend.file(&self.namespace, &self.path).await?;
        if file.kind.is_dir() {
            return Err(PluginError::NotFound(format!("file {}", self.path)));
        }
        let ct = pick_content_type(self.content_type.as_deref(), &file.mime_type, &file.data);
        Ok(GatewayResponse::new(StatusCode::OK, &ct, file.data))
    }
}

// ============================================================================
// target-namespace-var / target-flow-var
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NamespaceVarConfig {
    #[serde(default)]
    namespace: Option<String>,
    variable: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FlowVarConfig {
    #[serde(default)]
    namespace: Option<String>,
    flow: String,
    variable: String,
    #[serde(default)]
    content_type: Option<String>,
}

struct VariableTarget {
    owner: VarOwner,
    name: String,
    content_type: Option<String>,
    backend: Arc<dyn GatewayBackend>,
}

pub fn namespace_var(config: &Value, env: &PluginEnv) -> Result<Arc<dyn TargetPlugin>, PluginError> {
    let typ = "target-namespace-var";
    let config: NamespaceVarConfig = parse_config(typ, config)?;
    if config.variable.trim().is_empty() {
        return Err(PluginError::config(typ, "variable cannot be empty"));
    }
    let namespace = env.target_namespace(typ, config.namespace.as_deref())?;
    Ok(Arc::new(VariableTarget {
        owner: VarOwner::namespace(namespace),
        name: config.variable,
        content_type: config.content_type,
        backend: env.backend.clone(),
    }))
}

pub fn flow_var(config: &Value, env: &PluginEnv) -> Result<Arc<dyn TargetPlugin>, PluginError> {
    let typ = "target-flow-var";
    let config: FlowVarConfig = parse_config(typ, config)?;
    if config.variable.trim().is_empty() || config.flow.trim().is_empty() {
        return Err(PluginError::config(typ, "flow and variable are required"));
    }
    let namespace = env.target_namespace(typ, config.namespace.as_deref())?;
    Ok(Arc::new(VariableTarget {
        owner: VarOwner::workflow(namespace, normalize_path(&config.flow)),
        name: config.variable,
        content_type: config.content_type,
        backend: env.backend.clone(),
    }))
}

#[async_trait]
impl TargetPlugin for VariableTarget {
    async fn serve(&self, _req: &GatewayRequest) -> Result<GatewayResponse, PluginError> {
        let var = self.backend.variable(&self.owner, &self.name).await?;
        let ct = pick_content_type(self.content_type.as_deref(), &var.meta.mime_type, &var.data);
        Ok(GatewayResponse::new(StatusCode::OK, &ct, var.data))
    }
}

// ============================================================================
// target-debug
// ============================================================================

struct DebugTarget;

pub fn debug_target(config: &Value, _env: &PluginEnv) -> Result<Arc<dyn TargetPlugin>, PluginError> {
    parse_config::<serde_json::Map<String, Value>>("target-debug", config)?;
    Ok(Arc::new(DebugTarget))
}

#[async_trait]
impl TargetPlugin for DebugTarget {
    async fn serve(&self, req: &GatewayRequest) -> Result<GatewayResponse, PluginError> {
        let doc = json!({
            "namespace": req.namespace,
            "method": req.method.as_str(),
            "path": req.path,
            "url_params": req.params,
            "query_params": req.query_map(),
            "headers": req.header_map(),
            "consumer": req.consumer.as_ref().map(|c| c.to_value()),
            "body": String::from_utf8_lossy(&req.body),
        });
        Ok(GatewayResponse::json(StatusCode::OK, &doc))
    }
}

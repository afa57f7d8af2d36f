// Instance routes
// Decision: A synchronous start that outlives its wait returns 202 with the instance summary
// Decision: Status streams are SSE with one "status" event per update

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use direktiv_core::file::normalize_path;
use direktiv_core::{ErrorResponse, InstanceData, InstanceStatus, Invoker};
use direktiv_engine::StartRequest;
use direktiv_events::ListenerInfo;
use direktiv_storage::InstanceFilter;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::{data, ensure_namespace, AppState};
use crate::error::{ApiError, ApiResult};

/// Wait applied to synchronous starts without an explicit timeout
const DEFAULT_WAIT: Duration = Duration::from_secs(60);

const INSTANCE_ID_HEADER: &str = "direktiv-instance-id";
const INSTANCE_ERROR_CODE_HEADER: &str = "direktiv-instance-error-code";
const INSTANCE_ERROR_MESSAGE_HEADER: &str = "direktiv-instance-error-message";

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v2/namespaces/:namespace/instances",
            get(list_instances).post(start_instance),
        )
        .route(
            "/api/v2/namespaces/:namespace/instances/:id",
            get(get_instance).patch(patch_instance),
        )
        .route(
            "/api/v2/namespaces/:namespace/instances/:id/output",
            get(instance_output),
        )
        .route(
            "/api/v2/namespaces/:namespace/instances/:id/logs",
            get(instance_logs),
        )
        .route(
            "/api/v2/namespaces/:namespace/instances/:id/stream",
            get(stream_instance),
        )
        .route("/api/v2/namespaces/:namespace/triggers", get(list_triggers))
}

// ============================================================================
// Views
// ============================================================================

/// Instance as shown to clients; the engine cursor stays internal
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceView {
    id: Uuid,
    namespace: String,
    path: String,
    revision: Uuid,
    status: InstanceStatus,
    invoker: Invoker,
    flow: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<Uuid>,
    depth: u32,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl From<InstanceData> for InstanceView {
    fn from(inst: InstanceData) -> Self {
        Self {
            id: inst.id,
            namespace: inst.namespace,
            path: inst.workflow_path,
            revision: inst.revision,
            status: inst.status,
            invoker: inst.invoker,
            flow: inst.flow,
            error_code: inst.error_code,
            error_message: inst.error_message,
            parent: inst.parent.map(|p| p.instance_id),
            depth: inst.depth,
            created_at: inst.created_at,
            ended_at: inst.ended_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct Schedule {
    path: String,
    cron: String,
    next: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct Triggers {
    listeners: Vec<ListenerInfo>,
    schedules: Vec<Schedule>,
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
struct StartQuery {
    path: String,
    #[serde(default)]
    wait: bool,
    /// Seconds to wait for a synchronous start
    timeout: Option<u64>,
}

async fn start_instance(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<StartQuery>,
    body: Bytes,
) -> ApiResult<Response> {
    ensure_namespace(&node, &namespace).await?;
    let request = StartRequest::new(&namespace, &query.path, body.to_vec());
    let inst = node.engine.start_instance(request).await?;
    info!(%namespace, path = %inst.workflow_path, instance_id = %inst.id, wait = query.wait, "instance started");

    if !query.wait {
        let id = inst.id;
        return Ok(with_instance_id(
            (StatusCode::OK, data(InstanceView::from(inst))).into_response(),
            id,
        ));
    }

    let timeout = query.timeout.map(Duration::from_secs).unwrap_or(DEFAULT_WAIT);
    let inst = node.engine.wait(inst.id, timeout).await?;
    Ok(finished(inst))
}

fn with_instance_id(mut response: Response, id: Uuid) -> Response {
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert(INSTANCE_ID_HEADER, value);
    }
    response
}

/// Response for a synchronous start: raw output, an error envelope, or the still running instance
fn finished(inst: InstanceData) -> Response {
    let id = inst.id;
    let response = match inst.status {
        InstanceStatus::Complete => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            Body::from(inst.output.unwrap_or_default()),
        )
            .into_response(),
        InstanceStatus::Pending => {
            (StatusCode::ACCEPTED, data(InstanceView::from(inst))).into_response()
        }
        _ => {
            let code = inst
                .error_code
                .clone()
                .unwrap_or_else(|| "direktiv.unknown".to_string());
            let message = inst.error_message.clone().unwrap_or_default();
            let mut response = (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(code.clone(), message.clone())),
            )
                .into_response();
            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&code) {
                headers.insert(INSTANCE_ERROR_CODE_HEADER, v);
            }
            if let Ok(v) = HeaderValue::from_str(&message) {
                headers.insert(INSTANCE_ERROR_MESSAGE_HEADER, v);
            }
            response
        }
    };
    with_instance_id(response, id)
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    status: Option<InstanceStatus>,
    path: Option<String>,
    #[serde(default)]
    offset: u32,
    limit: Option<u32>,
}

async fn list_instances(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let mut filter = InstanceFilter {
        status: query.status,
        workflow_path: query.path.as_deref().map(normalize_path),
        offset: query.offset,
        ..Default::default()
    };
    if let Some(limit) = query.limit {
        filter.limit = limit.clamp(1, 1000);
    }
    let instances = node.engine.list(&namespace, &filter).await?;
    Ok(data(
        instances
            .into_iter()
            .map(InstanceView::from)
            .collect::<Vec<_>>(),
    ))
}

async fn get_instance(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let inst = node.engine.get_in(&namespace, id).await?;
    Ok(data(InstanceView::from(inst)))
}

async fn instance_output(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, Uuid)>,
) -> ApiResult<Response> {
    ensure_namespace(&node, &namespace).await?;
    let inst = node.engine.get_in(&namespace, id).await?;
    let Some(output) = inst.output else {
        return Err(ApiError::NotFound(format!("output of instance {id}")));
    };
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(output),
    )
        .into_response())
}

async fn instance_logs(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    node.engine.get_in(&namespace, id).await?;
    Ok(data(node.engine.logs(id).await?))
}

async fn stream_instance(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    node.engine.get_in(&namespace, id).await?;
    let updates = node.engine.watch(id).await?;
    debug!(instance_id = %id, "status stream opened");
    let events = updates.map(|update| SseEvent::default().event("status").json_data(update));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct PatchInstance {
    status: InstanceStatus,
}

async fn patch_instance(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, Uuid)>,
    Json(patch): Json<PatchInstance>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    if patch.status != InstanceStatus::Cancelled {
        return Err(ApiError::bad_request("only cancellation is supported"));
    }
    node.engine.get_in(&namespace, id).await?;
    node.engine.cancel(id).await?;
    info!(%namespace, instance_id = %id, "instance cancellation requested");
    Ok(data(InstanceView::from(node.engine.get(id).await?)))
}

async fn list_triggers(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let schedules = node
        .engine
        .schedules(&namespace)
        .into_iter()
        .map(|(path, cron, next)| Schedule { path, cron, next })
        .collect();
    Ok(data(Triggers {
        listeners: node.engine.correlator().listeners(&namespace),
        schedules,
    }))
}

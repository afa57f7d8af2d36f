// Service routes over the reconciler's view of the runtime

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::Router;
use direktiv_reconciler::ServiceFilter;
use tracing::info;

use super::{data, ensure_namespace, AppState};
use crate::error::ApiResult;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v2/namespaces/:namespace/services", get(list_services))
        .route(
            "/api/v2/namespaces/:namespace/services/:id",
            get(get_service),
        )
        .route(
            "/api/v2/namespaces/:namespace/services/:id/pods",
            get(list_pods),
        )
        .route(
            "/api/v2/namespaces/:namespace/services/:id/pods/:pod",
            delete(kill_pod),
        )
        .route(
            "/api/v2/namespaces/:namespace/services/:id/pods/:pod/logs",
            get(pod_logs),
        )
}

async fn list_services(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let filter = ServiceFilter {
        namespace: Some(namespace),
        ..Default::default()
    };
    Ok(data(node.reconciler.list(&filter).await?))
}

async fn get_service(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    Ok(data(node.reconciler.get(&namespace, &id).await?))
}

async fn list_pods(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    Ok(data(node.reconciler.pods(&namespace, &id).await?))
}

async fn pod_logs(
    State(node): State<AppState>,
    Path((namespace, id, pod)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    ensure_namespace(&node, &namespace).await?;
    let logs = node.reconciler.logs(&namespace, &id, &pod).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(logs),
    )
        .into_response())
}

async fn kill_pod(
    State(node): State<AppState>,
    Path((namespace, id, pod)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    node.reconciler.kill_pod(&namespace, &id, &pod).await?;
    info!(%namespace, service = %id, %pod, "pod killed");
    Ok(StatusCode::NO_CONTENT)
}

// Namespace routes

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use direktiv_core::validate_name;
use serde::Deserialize;
use tracing::info;

use super::{data, AppState};
use crate::error::{ApiError, ApiResult};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v2/namespaces", get(list_namespaces).post(create_namespace))
        .route(
            "/api/v2/namespaces/:namespace",
            get(get_namespace).delete(delete_namespace),
        )
}

#[derive(Debug, Deserialize)]
struct CreateNamespaceRequest {
    name: String,
    /// Return the existing namespace instead of a conflict
    #[serde(default)]
    idempotent: bool,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    recursive: bool,
}

async fn list_namespaces(State(node): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(node.storage.namespaces.list_namespaces().await?))
}

async fn create_namespace(
    State(node): State<AppState>,
    Json(req): Json<CreateNamespaceRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_name(&req.name).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let namespace = node
        .storage
        .namespaces
        .create_namespace(&req.name, req.idempotent)
        .await?;
    info!(namespace = %namespace.name, "namespace created");
    Ok((StatusCode::OK, data(namespace)))
}

async fn get_namespace(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(data(node.namespace(&namespace).await?))
}

async fn delete_namespace(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<impl IntoResponse> {
    let existed = node
        .storage
        .namespaces
        .delete_namespace(&namespace, query.recursive)
        .await?;
    if existed {
        info!(%namespace, "namespace deleted");
        node.forget_namespace(&namespace).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

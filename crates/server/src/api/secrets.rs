// Secret routes; values are write-only through the API

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use super::{data, decode_b64, ensure_namespace, AppState};
use crate::error::{ApiError, ApiResult};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v2/namespaces/:namespace/secrets",
            get(list_secrets).post(create_secret),
        )
        .route(
            "/api/v2/namespaces/:namespace/secrets/:name",
            get(get_secret).delete(delete_secret),
        )
}

#[derive(Debug, Deserialize)]
struct CreateSecretRequest {
    name: String,
    #[serde(default)]
    data: String,
}

async fn list_secrets(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    Ok(data(node.storage.secrets.list_secrets(&namespace).await?))
}

async fn create_secret(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
    Json(req): Json<CreateSecretRequest>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("secret name cannot be empty"));
    }
    let value = decode_b64("data", &req.data)?;
    let meta = node
        .storage
        .secrets
        .set_secret(&namespace, &req.name, value)
        .await?;
    info!(%namespace, name = %meta.name, "secret created");
    Ok(data(meta))
}

async fn get_secret(
    State(node): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let meta = node
        .storage
        .secrets
        .list_secrets(&namespace)
        .await?
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| ApiError::NotFound(format!("secret {name}")))?;
    Ok(data(meta))
}

async fn delete_secret(
    State(node): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    node.storage.secrets.delete_secret(&namespace, &name).await?;
    info!(%namespace, %name, "secret deleted");
    Ok(StatusCode::NO_CONTENT)
}

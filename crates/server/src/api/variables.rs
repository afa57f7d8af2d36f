// Variable routes
// Decision: JSON bodies carry values up to the inline limit; larger values use the parcel upload route

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use direktiv_core::file::normalize_path;
use direktiv_core::{VarOwner, VariableMeta};
use direktiv_storage::parcel::parcels;
use direktiv_storage::{ParcelUpload, VariablePatch, INLINE_LIMIT, PARCEL_SIZE};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{data, decode_b64, ensure_namespace, AppState};
use crate::error::{ApiError, ApiResult};

const DEFAULT_MIME: &str = "application/octet-stream";

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v2/namespaces/:namespace/variables",
            get(list_variables).post(create_variable),
        )
        .route(
            "/api/v2/namespaces/:namespace/variables/upload",
            post(upload_variable),
        )
        .route(
            "/api/v2/namespaces/:namespace/variables/:id",
            get(get_variable)
                .patch(update_variable)
                .delete(delete_variable),
        )
        .route(
            "/api/v2/namespaces/:namespace/variables/:id/raw",
            get(download_variable),
        )
}

/// Owner selection shared by queries and bodies; namespace scope when both are absent
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerParams {
    workflow_path: Option<String>,
    instance_id: Option<Uuid>,
}

impl OwnerParams {
    fn owner(&self, namespace: &str) -> ApiResult<VarOwner> {
        match (&self.workflow_path, self.instance_id) {
            (Some(_), Some(_)) => Err(ApiError::bad_request(
                "workflowPath and instanceId are mutually exclusive",
            )),
            (Some(path), None) => Ok(VarOwner::workflow(namespace, normalize_path(path))),
            (None, Some(id)) => Ok(VarOwner::instance(namespace, id)),
            (None, None) => Ok(VarOwner::namespace(namespace)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    name: Option<String>,
    #[serde(flatten)]
    owner: OwnerParams,
}

#[derive(Debug, Deserialize)]
struct CreateVariableRequest {
    name: String,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    data: String,
    #[serde(flatten)]
    owner: OwnerParams,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateVariableRequest {
    name: Option<String>,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    name: String,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    #[serde(flatten)]
    owner: OwnerParams,
}

#[derive(Debug, Serialize)]
struct Uploaded {
    #[serde(flatten)]
    meta: VariableMeta,
    /// Digest of the bytes received, for end-to-end verification
    received: String,
}

fn inline_value(encoded: &str) -> ApiResult<Vec<u8>> {
    let bytes = decode_b64("data", encoded)?;
    if bytes.len() > INLINE_LIMIT {
        return Err(ApiError::bad_request(format!(
            "inline values are limited to {INLINE_LIMIT} bytes, use the upload route"
        )));
    }
    Ok(bytes)
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_variables(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let owner = query.owner.owner(&namespace)?;
    let mut vars = node.storage.variables.list_variables(&owner).await?;
    if let Some(name) = &query.name {
        vars.retain(|v| &v.name == name);
    }
    Ok(data(vars))
}

async fn create_variable(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
    Json(req): Json<CreateVariableRequest>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let owner = req.owner.owner(&namespace)?;
    let bytes = inline_value(&req.data)?;
    let mime = req.mime_type.as_deref().unwrap_or(DEFAULT_MIME);
    let meta = node
        .storage
        .variables
        .set_variable(&owner, &req.name, mime, bytes)
        .await?;
    info!(%namespace, scope = %meta.scope, name = %meta.name, size = meta.size, "variable set");
    Ok(data(meta))
}

async fn get_variable(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    Ok(data(
        node.storage
            .variables
            .get_variable_by_id(&namespace, id)
            .await?,
    ))
}

async fn download_variable(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, Uuid)>,
) -> ApiResult<Response> {
    ensure_namespace(&node, &namespace).await?;
    let var = node
        .storage
        .variables
        .get_variable_by_id(&namespace, id)
        .await?;
    let mime = if var.meta.mime_type.is_empty() {
        DEFAULT_MIME.to_string()
    } else {
        var.meta.mime_type.clone()
    };
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime),
            (header::CONTENT_LENGTH, var.meta.size.to_string()),
        ],
        Body::from_stream(parcels(var.data, PARCEL_SIZE)),
    )
        .into_response())
}

async fn update_variable(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, Uuid)>,
    Json(req): Json<UpdateVariableRequest>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let patch = VariablePatch {
        name: req.name,
        mime_type: req.mime_type,
        data: req.data.as_deref().map(inline_value).transpose()?,
    };
    let meta = node
        .storage
        .variables
        .update_variable(&namespace, id, patch)
        .await?;
    Ok(data(meta))
}

async fn delete_variable(
    State(node): State<AppState>,
    Path((namespace, id)): Path<(String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    node.storage.variables.delete_variable(&namespace, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Parcel upload: the advertised Content-Length is checked against the cap before any byte is read
async fn upload_variable(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let owner = query.owner.owner(&namespace)?;
    let total = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| ApiError::bad_request("Content-Length is required"))?;

    let body = Box::pin(request.into_body().into_data_stream());
    let upload = ParcelUpload::collect(total, node.storage.limit, body).await?;
    let mime = query.mime_type.as_deref().unwrap_or(DEFAULT_MIME);
    let meta = node
        .storage
        .variables
        .set_variable(&owner, &query.name, mime, upload.data)
        .await?;
    info!(%namespace, name = %meta.name, size = meta.size, "variable uploaded");
    Ok(data(Uploaded {
        meta,
        received: upload.checksum,
    }))
}

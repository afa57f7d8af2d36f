// File tree routes
// Decision: Every write rebuilds derived state for the namespace before responding

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use direktiv_core::file::{clean_path, parent_path};
use direktiv_core::{File, FileKind};
use direktiv_storage::FileRevision;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{data, decode_b64, ensure_namespace, AppState};
use crate::error::{ApiError, ApiResult};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v2/namespaces/:namespace/files",
            get(get_root).post(create_in_root),
        )
        .route(
            "/api/v2/namespaces/:namespace/files/*path",
            get(get_file)
                .post(create_file)
                .patch(update_file)
                .delete(delete_file),
        )
        .route(
            "/api/v2/namespaces/:namespace/revisions/*path",
            get(list_revisions),
        )
}

#[derive(Debug, Deserialize)]
struct CreateFileRequest {
    name: String,
    #[serde(rename = "type")]
    kind: FileKind,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateFileRequest {
    /// New absolute path
    path: Option<String>,
    data: Option<String>,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GetQuery {
    revision: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    recursive: bool,
}

#[derive(Debug, Serialize)]
struct FileView {
    #[serde(flatten)]
    file: File,
    #[serde(skip_serializing_if = "Option::is_none")]
    children: Option<Vec<File>>,
}

fn path_param(raw: &str) -> ApiResult<String> {
    clean_path(raw).map_err(|e| ApiError::bad_request(e.to_string()))
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_root(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    view(&node, &namespace, "/", None).await
}

async fn get_file(
    State(node): State<AppState>,
    Path((namespace, path)): Path<(String, String)>,
    Query(query): Query<GetQuery>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let path = path_param(&path)?;
    view(&node, &namespace, &path, query.revision).await
}

async fn view(
    node: &AppState,
    namespace: &str,
    path: &str,
    revision: Option<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let file = match revision {
        Some(revision) => {
            node.storage
                .files
                .get_revision(namespace, path, revision)
                .await?
        }
        None => node.storage.files.get_file(namespace, path).await?,
    };
    let children = if file.kind.is_dir() {
        let mut children = node.storage.files.read_dir(namespace, path).await?;
        // listings carry metadata only
        for child in &mut children {
            child.data.clear();
        }
        Some(children)
    } else {
        None
    };
    Ok(data(FileView { file, children }))
}

async fn create_in_root(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
    Json(req): Json<CreateFileRequest>,
) -> ApiResult<impl IntoResponse> {
    create(&node, &namespace, "/", req).await
}

async fn create_file(
    State(node): State<AppState>,
    Path((namespace, dir)): Path<(String, String)>,
    Json(req): Json<CreateFileRequest>,
) -> ApiResult<impl IntoResponse> {
    let dir = path_param(&dir)?;
    create(&node, &namespace, &dir, req).await
}

async fn create(
    node: &AppState,
    namespace: &str,
    dir: &str,
    req: CreateFileRequest,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(node, namespace).await?;
    if req.name.is_empty() || req.name.contains('/') {
        return Err(ApiError::bad_request("name must be a single path segment"));
    }
    let path = path_param(&format!("{dir}/{}", req.name))?;
    let bytes = decode_b64("data", &req.data)?;
    let mime = req
        .mime_type
        .unwrap_or_else(|| req.kind.default_mime().to_string());

    let file = node
        .storage
        .files
        .create_file(namespace, &path, req.kind, &mime, bytes)
        .await?;
    info!(%namespace, path = %file.path, kind = %file.kind, "file created");
    node.files_changed(namespace).await;
    Ok((StatusCode::OK, data(file)))
}

async fn update_file(
    State(node): State<AppState>,
    Path((namespace, path)): Path<(String, String)>,
    Json(req): Json<UpdateFileRequest>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let mut path = path_param(&path)?;
    if req.path.is_none() && req.data.is_none() && req.mime_type.is_none() {
        return Err(ApiError::bad_request("nothing to update"));
    }

    let mut file = None;
    if let Some(target) = &req.path {
        let target = path_param(target)?;
        if target == "/" || parent_path(&target).is_none() {
            return Err(ApiError::bad_request("cannot move onto the root"));
        }
        if target != path {
            file = Some(node.storage.files.rename_file(&namespace, &path, &target).await?);
            path = target;
        }
    }
    if req.data.is_some() || req.mime_type.is_some() {
        let bytes = match &req.data {
            Some(encoded) => decode_b64("data", encoded)?,
            None => node.storage.files.get_file(&namespace, &path).await?.data,
        };
        file = Some(
            node.storage
                .files
                .update_file(&namespace, &path, req.mime_type.as_deref(), bytes)
                .await?,
        );
    }
    let file = match file {
        Some(file) => file,
        None => node.storage.files.get_file(&namespace, &path).await?,
    };

    info!(%namespace, path = %file.path, "file updated");
    node.files_changed(&namespace).await;
    Ok(data(file))
}

async fn delete_file(
    State(node): State<AppState>,
    Path((namespace, path)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let path = path_param(&path)?;
    if path == "/" {
        return Err(ApiError::bad_request("the root directory cannot be deleted"));
    }
    node.storage
        .files
        .delete_file(&namespace, &path, query.recursive)
        .await?;
    info!(%namespace, %path, "file deleted");
    node.files_changed(&namespace).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_revisions(
    State(node): State<AppState>,
    Path((namespace, path)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let path = path_param(&path)?;
    let revisions: Vec<FileRevision> = node.storage.files.list_revisions(&namespace, &path).await?;
    Ok(data(revisions))
}

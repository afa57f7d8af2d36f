// Gateway introspection: compiled routes with their errors, and consumers without credentials

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use super::{data, ensure_namespace, AppState};
use crate::error::ApiResult;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v2/namespaces/:namespace/gateway/routes", get(routes_info))
        .route(
            "/api/v2/namespaces/:namespace/gateway/consumers",
            get(consumers_info),
        )
}

async fn routes_info(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    Ok(data(node.gateway.routes(&namespace)))
}

async fn consumers_info(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    Ok(data(node.gateway.consumers(&namespace)))
}

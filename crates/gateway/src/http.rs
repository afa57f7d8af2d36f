// Gateway HTTP surface
//
// /ns/{namespace}/*path  endpoints of a namespace
// /gw/*path              endpoints of the system namespace

use std::any::Any;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use direktiv_core::ErrorResponse;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::envelope;
use crate::gateway::Gateway;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ns/:namespace", any(namespace_root))
        .route("/ns/:namespace/*path", any(namespace_path))
        .route("/gw", any(system_root))
        .route("/gw/*path", any(system_path))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

type QueryPairs = Query<Vec<(String, String)>>;

async fn namespace_root(
    State(gateway): State<Arc<Gateway>>,
    Path(namespace): Path<String>,
    method: Method,
    Query(query): QueryPairs,
    headers: HeaderMap,
    body: Body,
) -> Response {
    gateway.serve(&namespace, method, "/", headers, query, body).await
}

async fn namespace_path(
    State(gateway): State<Arc<Gateway>>,
    Path((namespace, path)): Path<(String, String)>,
    method: Method,
    Query(query): QueryPairs,
    headers: HeaderMap,
    body: Body,
) -> Response {
    gateway.serve(&namespace, method, &path, headers, query, body).await
}

async fn system_root(
    State(gateway): State<Arc<Gateway>>,
    method: Method,
    Query(query): QueryPairs,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let namespace = gateway.config().system_namespace.clone();
    gateway.serve(&namespace, method, "/", headers, query, body).await
}

async fn system_path(
    State(gateway): State<Arc<Gateway>>,
    Path(path): Path<String>,
    method: Method,
    Query(query): QueryPairs,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let namespace = gateway.config().system_namespace.clone();
    gateway.serve(&namespace, method, &path, headers, query, body).await
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(%detail, "gateway handler panicked");
    envelope(
        StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        ErrorResponse::new("internal", "gateway request failed"),
    )
}

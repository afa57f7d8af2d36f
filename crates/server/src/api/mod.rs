// REST API under /api/v2
//
// Every successful response wraps its payload as {"data": ...}; failures use
// the shared error envelope. Namespaced routes check the namespace first.

mod events;
mod files;
mod gateway;
mod instances;
mod namespaces;
mod secrets;
mod services;
mod variables;

use std::any::Any;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use direktiv_core::ErrorResponse;
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::auth::{require_api_key, ApiKey};
use crate::error::{ApiError, ApiResult};
use crate::node::Node;

pub type AppState = Arc<Node>;

/// Response wrapper shared by every endpoint
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

pub(crate) fn data<T: Serialize>(data: T) -> Json<DataResponse<T>> {
    Json(DataResponse { data })
}

/// API, gateway and status routes of a flow node
pub fn router(node: AppState) -> Router {
    let key = ApiKey::new(node.config.api_key.clone());
    let api = Router::new()
        .route("/api/v2/status", get(status))
        .merge(namespaces::routes())
        .merge(files::routes())
        .merge(instances::routes())
        .merge(variables::routes())
        .merge(secrets::routes())
        .merge(events::routes())
        .merge(services::routes())
        .merge(gateway::routes())
        .with_state(node.clone())
        .layer(middleware::from_fn_with_state(key, require_api_key))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http());

    api.merge(direktiv_gateway::router(node.gateway.clone()))
}

#[derive(Serialize)]
struct Status {
    version: &'static str,
    node: String,
    #[serde(rename = "functionsBackend")]
    functions_backend: String,
    nodes: usize,
}

async fn status(axum::extract::State(node): axum::extract::State<AppState>) -> impl IntoResponse {
    data(Status {
        version: env!("CARGO_PKG_VERSION"),
        node: node.engine.config().node.clone(),
        functions_backend: format!("{:?}", node.config.functions_backend).to_lowercase(),
        nodes: node.bus().map(|b| b.nodes().len()).unwrap_or(1),
    })
}

/// The namespace must exist before anything inside it is touched
pub(crate) async fn ensure_namespace(node: &Node, namespace: &str) -> ApiResult<()> {
    node.namespace(namespace).await.map(|_| ())
}

pub(crate) fn decode_b64(field: &str, value: &str) -> ApiResult<Vec<u8>> {
    STANDARD
        .decode(value.as_bytes())
        .map_err(|e| ApiError::bad_request(format!("{field} is not valid base64: {e}")))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(%detail, "api handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("internal", "internal server error")),
    )
        .into_response()
}

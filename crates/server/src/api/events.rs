// Event routes: broadcast into a namespace and read back its recent history

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use direktiv_events::CloudEvent;
use serde::Deserialize;
use tracing::debug;

use super::{data, ensure_namespace, AppState};
use crate::error::ApiResult;

const DEFAULT_HISTORY: usize = 100;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v2/namespaces/:namespace/events/broadcast",
            post(broadcast),
        )
        .route("/api/v2/namespaces/:namespace/events/history", get(history))
}

async fn broadcast(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let event = CloudEvent::parse(&body)?;
    debug!(%namespace, event_type = %event.event_type, event_id = %event.id, "event received");
    node.engine.broadcast(&namespace, event).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn history(
    State(node): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    ensure_namespace(&node, &namespace).await?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY);
    Ok(data(node.engine.correlator().history(&namespace, limit)))
}

// Sidecar HTTP surface
//
// POST /   run a command request; requires Direktiv-ActionID and Direktiv-TempDir
// GET  /up liveness

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::command::{CommandRequest, CommandResult};
use crate::error::{error_response, ExecError};
use crate::executor::{ActionContext, Executor};

pub const ACTION_ID_HEADER: &str = "Direktiv-ActionID";
pub const TEMP_DIR_HEADER: &str = "Direktiv-TempDir";

pub fn router(executor: Arc<Executor>) -> Router {
    Router::new()
        .route("/", post(run_commands))
        .route("/up", get(|| async { "OK" }))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(executor)
}

async fn run_commands(
    State(executor): State<Arc<Executor>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Vec<CommandResult>>, ExecError> {
    let action_id = required(&headers, ACTION_ID_HEADER)?;
    let temp_dir = required(&headers, TEMP_DIR_HEADER)?;
    let request: CommandRequest = serde_json::from_slice(&body)
        .map_err(|e| ExecError::BadRequest(format!("invalid command payload: {e}")))?;

    let ctx = ActionContext {
        action_id,
        temp_dir: PathBuf::from(temp_dir),
    };
    let run = executor.execute(&ctx, &request).await?;
    Ok(Json(run.results))
}

fn required(headers: &HeaderMap, name: &'static str) -> Result<String, ExecError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ExecError::MissingHeader(name))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(%detail, "command handler panicked");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "command executor panicked",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ERROR_CODE_HEADER, ERROR_MESSAGE_HEADER};
    use crate::executor::SidecarConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(Executor::new(SidecarConfig::default().with_stdout(false))))
    }

    #[tokio::test]
    async fn test_up() {
        let response = app()
            .oneshot(Request::get("/up").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_headers_rejected() {
        let response = app()
            .oneshot(
                Request::post("/")
                    .header(ACTION_ID_HEADER, "a1")
                    .body(Body::from(r#"{"commands":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[ERROR_CODE_HEADER],
            "request_data_invalid"
        );
        assert!(response.headers()[ERROR_MESSAGE_HEADER]
            .to_str()
            .unwrap()
            .contains(TEMP_DIR_HEADER));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "request_data_invalid");
    }

    #[tokio::test]
    async fn test_runs_commands() {
        let dir = tempfile::tempdir().unwrap();
        let response = app()
            .oneshot(
                Request::post("/")
                    .header(ACTION_ID_HEADER, "a1")
                    .header(TEMP_DIR_HEADER, dir.path().to_str().unwrap())
                    .body(Body::from(
                        r#"{"commands":[{"command":"echo hi"},{"command":"nope-not-here"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let results: Vec<CommandResult> = serde_json::from_slice(&body).unwrap();
        assert_eq!(results[0].output, "hi\n");
        assert_eq!(
            results[1].error.as_deref(),
            Some("exec: \"nope-not-here\": executable file not found in $PATH")
        );
    }
}

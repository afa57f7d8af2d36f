// HTTP surface of a bus node
// Decision: The daemon port carries frames; admin ports answer readiness and list nodes

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::bus::Bus;
use crate::membership::MemberView;
use crate::message::WireMessage;
use crate::readiness::PING_PATH;
use crate::transport::FRAME_PATH;

/// Routes served on the daemon port
pub fn daemon_router(bus: Bus) -> Router {
    Router::new()
        .route(FRAME_PATH, post(receive_frame))
        .with_state(bus)
}

/// Routes served on the admin and directory ports
pub fn admin_router(bus: Bus) -> Router {
    Router::new()
        .route(PING_PATH, get(ping))
        .route("/nodes", get(list_nodes))
        .with_state(bus)
}

async fn receive_frame(State(bus): State<Bus>, Json(frame): Json<WireMessage>) -> StatusCode {
    bus.handle_frame(frame).await;
    StatusCode::NO_CONTENT
}

async fn ping() -> &'static str {
    "OK"
}

async fn list_nodes(State(bus): State<Bus>) -> Json<Vec<MemberView>> {
    Json(bus.nodes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::finder::StaticFinder;
    use crate::transport::LocalNetwork;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn bus() -> Bus {
        Bus::new(
            BusConfig::new("a", "a:4150"),
            Arc::new(LocalNetwork::new().transport()),
            Arc::new(StaticFinder::default()),
        )
    }

    #[tokio::test]
    async fn test_ping_returns_ok() {
        let resp = admin_router(bus())
            .oneshot(Request::get(PING_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_nodes_lists_self() {
        let resp = admin_router(bus())
            .oneshot(Request::get("/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let nodes: Vec<MemberView> = serde_json::from_slice(&body).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "a");
    }

    #[tokio::test]
    async fn test_frame_is_delivered() {
        let bus = bus();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = bus
            .subscribe("t", "c", Arc::new(move |m: crate::message::BusMessage| {
                let _ = tx.send(m);
            }))
            .unwrap();

        let frame = WireMessage::Deliver {
            channels: vec!["c".into()],
            message: crate::message::BusMessage::new("t", "b", b"hi".to_vec()),
        };
        let resp = daemon_router(bus)
            .oneshot(
                Request::post(FRAME_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&frame).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(rx.recv().await.unwrap().payload, b"hi");
    }
}

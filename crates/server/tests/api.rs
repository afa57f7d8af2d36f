//! REST API end to end against an in-memory node

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use direktiv_core::Config;
use direktiv_server::{router, Node, API_KEY_HEADER};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

const NS: &str = "ns";

struct Harness {
    node: Arc<Node>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    async fn with_config(config: Config) -> Self {
        let node = Node::memory(config).unwrap();
        node.start().await.unwrap();
        Self { node }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        router(self.node.clone()).oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn delete(&self, uri: &str) -> Response {
        self.send(Request::delete(uri).body(Body::empty()).unwrap()).await
    }

    async fn json(&self, method: &str, uri: &str, body: Value) -> Response {
        self.send(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn namespace(&self, name: &str) {
        let resp = self
            .json("POST", "/api/v2/namespaces", json!({"name": name}))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    async fn file(&self, ns: &str, dir: &str, name: &str, kind: &str, content: &str) -> Response {
        let uri = if dir == "/" {
            format!("/api/v2/namespaces/{ns}/files")
        } else {
            format!("/api/v2/namespaces/{ns}/files{dir}")
        };
        self.json(
            "POST",
            &uri,
            json!({"name": name, "type": kind, "data": STANDARD.encode(content)}),
        )
        .await
    }
}

async fn body_bytes(resp: Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(resp: Response) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

const NOOP: &str = "states:\n- id: a\n  type: noop\n  transform: 'jq({result: 42})'\n";

// ============================================================================
// Status and auth
// ============================================================================

#[tokio::test]
async fn test_status() {
    let h = Harness::new().await;
    let resp = h.get("/api/v2/status").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["data"]["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["data"]["functionsBackend"], "memory");
}

#[tokio::test]
async fn test_api_key_required_when_configured() {
    let config = Config {
        api_key: Some("letmein".to_string()),
        ..Config::default()
    };
    let h = Harness::with_config(config).await;

    // status stays open
    assert_eq!(h.get("/api/v2/status").await.status(), StatusCode::OK);

    let resp = h.get("/api/v2/namespaces").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["error"]["code"], "unauthorized");

    let resp = h
        .send(
            Request::get("/api/v2/namespaces")
                .header(API_KEY_HEADER, "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = h
        .send(
            Request::get("/api/v2/namespaces")
                .header(API_KEY_HEADER, "letmein")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

// ============================================================================
// Namespaces
// ============================================================================

#[tokio::test]
async fn test_namespace_lifecycle() {
    let h = Harness::new().await;
    h.namespace(NS).await;

    let resp = h
        .json("POST", "/api/v2/namespaces", json!({"name": NS}))
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = h
        .json(
            "POST",
            "/api/v2/namespaces",
            json!({"name": NS, "idempotent": true}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = h
        .json("POST", "/api/v2/namespaces", json!({"name": "Not Valid!"}))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let list = body_json(h.get("/api/v2/namespaces").await).await;
    assert_eq!(list["data"].as_array().unwrap().len(), 1);
    assert_eq!(list["data"][0]["name"], NS);

    let resp = h.get("/api/v2/namespaces/missing").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_namespace_delete_needs_recursive_when_not_empty() {
    let h = Harness::new().await;
    h.namespace(NS).await;
    let resp = h.file(NS, "/", "wf.yaml", "workflow", NOOP).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = h.delete("/api/v2/namespaces/ns").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = h.delete("/api/v2/namespaces/ns?recursive=true").await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        h.get("/api/v2/namespaces/ns").await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        h.get("/api/v2/namespaces/ns/files").await.status(),
        StatusCode::NOT_FOUND
    );
}

// ============================================================================
// Files
// ============================================================================

#[tokio::test]
async fn test_files_tree() {
    let h = Harness::new().await;
    h.namespace(NS).await;

    assert_eq!(
        h.file(NS, "/", "flows", "directory", "").await.status(),
        StatusCode::OK
    );
    let resp = h.file(NS, "/flows", "a.yaml", "workflow", NOOP).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let created = body_json(resp).await;
    assert_eq!(created["data"]["path"], "/flows/a.yaml");
    assert_eq!(created["data"]["mimeType"], "application/yaml");

    // parent must exist
    let resp = h.file(NS, "/nope", "b.yaml", "workflow", NOOP).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let dir = body_json(h.get("/api/v2/namespaces/ns/files/flows").await).await;
    assert_eq!(dir["data"]["type"], "directory");
    assert_eq!(dir["data"]["children"][0]["path"], "/flows/a.yaml");

    let file = body_json(h.get("/api/v2/namespaces/ns/files/flows/a.yaml").await).await;
    assert_eq!(file["data"]["data"], STANDARD.encode(NOOP));

    let resp = h
        .json(
            "PATCH",
            "/api/v2/namespaces/ns/files/flows/a.yaml",
            json!({"path": "/flows/b.yaml"}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["data"]["path"], "/flows/b.yaml");
    assert_eq!(
        h.get("/api/v2/namespaces/ns/files/flows/a.yaml").await.status(),
        StatusCode::NOT_FOUND
    );

    let resp = h.delete("/api/v2/namespaces/ns/files/flows").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let resp = h.delete("/api/v2/namespaces/ns/files/flows?recursive=true").await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_endpoint_file_is_routed() {
    let h = Harness::new().await;
    h.namespace(NS).await;
    let endpoint = r#"
direktiv_api: endpoint/v2
path: /ping
methods: [GET]
allow_anonymous: true
plugins:
  target:
    type: instant-response
    configuration:
      status_code: 200
      status_message: pong
"#;
    let resp = h.file(NS, "/", "ping.yaml", "endpoint", endpoint).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = h.get("/ns/ns/ping").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, b"pong");

    let routes = body_json(h.get("/api/v2/namespaces/ns/gateway/routes").await).await;
    assert_eq!(routes["data"][0]["server_path"], "/ns/ns/ping");

    let resp = h.delete("/api/v2/namespaces/ns/files/ping.yaml").await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(h.get("/ns/ns/ping").await.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Instances
// ============================================================================

#[test_log::test(tokio::test)]
async fn test_instance_sync_and_async() {
    let h = Harness::new().await;
    h.namespace(NS).await;
    h.file(NS, "/", "wf.yaml", "workflow", NOOP).await;

    let resp = h
        .send(
            Request::post("/api/v2/namespaces/ns/instances?path=/wf.yaml&wait=true")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("direktiv-instance-id"));
    assert_eq!(body_json(resp).await, json!({"result": 42}));

    let resp = h
        .send(
            Request::post("/api/v2/namespaces/ns/instances?path=/wf.yaml")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let started = body_json(resp).await;
    assert_eq!(started["data"]["path"], "/wf.yaml");
    let id = started["data"]["id"].as_str().unwrap().to_string();

    let id: uuid::Uuid = id.parse().unwrap();
    h.node
        .engine
        .wait(id, Duration::from_secs(10))
        .await
        .unwrap();

    let output = h
        .get(&format!("/api/v2/namespaces/ns/instances/{id}/output"))
        .await;
    assert_eq!(output.status(), StatusCode::OK);
    assert_eq!(body_json(output).await, json!({"result": 42}));

    let list = body_json(h.get("/api/v2/namespaces/ns/instances?status=complete").await).await;
    assert_eq!(list["data"].as_array().unwrap().len(), 2);

    let resp = h
        .send(
            Request::post("/api/v2/namespaces/ns/instances?path=/missing.yaml")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_instance_failure_headers() {
    let h = Harness::new().await;
    h.namespace(NS).await;
    let failing = "states:\n- id: a\n  type: error\n  error: app.broken\n  message: nope\n";
    h.file(NS, "/", "bad.yaml", "workflow", failing).await;

    let resp = h
        .send(
            Request::post("/api/v2/namespaces/ns/instances?path=/bad.yaml&wait=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        resp.headers()["direktiv-instance-error-code"],
        "app.broken"
    );
    assert_eq!(body_json(resp).await["error"]["code"], "app.broken");
}

#[test_log::test(tokio::test)]
async fn test_instance_cancel() {
    let h = Harness::new().await;
    h.namespace(NS).await;
    let sleep = "states:\n- id: s\n  type: delay\n  duration: PT1H\n";
    h.file(NS, "/", "sleep.yaml", "workflow", sleep).await;

    let started = body_json(
        h.send(
            Request::post("/api/v2/namespaces/ns/instances?path=/sleep.yaml")
                .body(Body::empty())
                .unwrap(),
        )
        .await,
    )
    .await;
    let id: uuid::Uuid = started["data"]["id"].as_str().unwrap().parse().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let resp = h
        .json(
            "PATCH",
            &format!("/api/v2/namespaces/ns/instances/{id}"),
            json!({"status": "cancelled"}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let inst = h.node.engine.wait(id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(inst.status, direktiv_core::InstanceStatus::Cancelled);

    // already finished
    let resp = h
        .json(
            "PATCH",
            &format!("/api/v2/namespaces/ns/instances/{id}"),
            json!({"status": "cancelled"}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let logs = h
        .get(&format!("/api/v2/namespaces/ns/instances/{id}/logs"))
        .await;
    assert_eq!(logs.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_instance_in_other_namespace_is_hidden() {
    let h = Harness::new().await;
    h.namespace(NS).await;
    h.namespace("other").await;
    h.file(NS, "/", "wf.yaml", "workflow", NOOP).await;

    let started = body_json(
        h.send(
            Request::post("/api/v2/namespaces/ns/instances?path=/wf.yaml")
                .body(Body::empty())
                .unwrap(),
        )
        .await,
    )
    .await;
    let id = started["data"]["id"].as_str().unwrap();
    let resp = h
        .get(&format!("/api/v2/namespaces/other/instances/{id}"))
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Variables and secrets
// ============================================================================

#[tokio::test]
async fn test_variables_crud() {
    let h = Harness::new().await;
    h.namespace(NS).await;

    let resp = h
        .json(
            "POST",
            "/api/v2/namespaces/ns/variables",
            json!({"name": "greeting", "mimeType": "text/plain", "data": STANDARD.encode("hello")}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let meta = body_json(resp).await;
    assert_eq!(meta["data"]["size"], 5);
    let id = meta["data"]["id"].as_str().unwrap().to_string();

    let list = body_json(h.get("/api/v2/namespaces/ns/variables?name=greeting").await).await;
    assert_eq!(list["data"][0]["id"], id.as_str());

    let var = body_json(h.get(&format!("/api/v2/namespaces/ns/variables/{id}")).await).await;
    assert_eq!(var["data"]["data"], STANDARD.encode("hello"));

    let raw = h.get(&format!("/api/v2/namespaces/ns/variables/{id}/raw")).await;
    assert_eq!(raw.status(), StatusCode::OK);
    assert_eq!(raw.headers()["content-type"], "text/plain");
    assert_eq!(body_bytes(raw).await, b"hello");

    let resp = h
        .json(
            "PATCH",
            &format!("/api/v2/namespaces/ns/variables/{id}"),
            json!({"data": STANDARD.encode("bye")}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["data"]["size"], 3);

    let resp = h.delete(&format!("/api/v2/namespaces/ns/variables/{id}")).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = h.get(&format!("/api/v2/namespaces/ns/variables/{id}")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_variable_upload() {
    let h = Harness::new().await;
    h.namespace(NS).await;
    let payload = vec![7u8; 200 * 1024];

    let resp = h
        .send(
            Request::post("/api/v2/namespaces/ns/variables/upload?name=blob&workflowPath=/wf.yaml")
                .header("content-length", payload.len().to_string())
                .body(Body::from(payload.clone()))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["data"]["scope"], "workflow");
    assert_eq!(body["data"]["received"], body["data"]["checksum"]);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let raw = h.get(&format!("/api/v2/namespaces/ns/variables/{id}/raw")).await;
    assert_eq!(body_bytes(raw).await, payload);

    // advertised size must match what arrives
    let resp = h
        .send(
            Request::post("/api/v2/namespaces/ns/variables/upload?name=short")
                .header("content-length", "10")
                .body(Body::from("12345"))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_secrets() {
    let h = Harness::new().await;
    h.namespace(NS).await;
    let create = json!({"name": "token", "data": STANDARD.encode("s3cret")});

    let resp = h.json("POST", "/api/v2/namespaces/ns/secrets", create.clone()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = h.json("POST", "/api/v2/namespaces/ns/secrets", create).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let list = body_json(h.get("/api/v2/namespaces/ns/secrets").await).await;
    assert_eq!(list["data"][0]["name"], "token");
    assert!(list["data"][0].get("value").is_none());

    assert_eq!(
        h.delete("/api/v2/namespaces/ns/secrets/token").await.status(),
        StatusCode::NO_CONTENT
    );
    assert_eq!(
        h.get("/api/v2/namespaces/ns/secrets/token").await.status(),
        StatusCode::NOT_FOUND
    );
}

// ============================================================================
// Events
// ============================================================================

#[test_log::test(tokio::test)]
async fn test_event_starts_workflow() {
    let h = Harness::new().await;
    h.namespace(NS).await;
    let listener = r#"
start:
  type: event
  event:
    type: com.example.order
states:
- id: a
  type: noop
"#;
    h.file(NS, "/", "on-order.yaml", "workflow", listener).await;

    let triggers = body_json(h.get("/api/v2/namespaces/ns/triggers").await).await;
    assert_eq!(triggers["data"]["listeners"].as_array().unwrap().len(), 1);

    let event = json!({
        "specversion": "1.0",
        "id": "evt-1",
        "source": "tests",
        "type": "com.example.order",
        "data": {"order": 7}
    });
    let resp = h
        .send(
            Request::post("/api/v2/namespaces/ns/events/broadcast")
                .body(Body::from(event.to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let history = body_json(h.get("/api/v2/namespaces/ns/events/history").await).await;
    assert_eq!(history["data"][0]["event"]["id"], "evt-1");

    let mut started = 0;
    for _ in 0..100 {
        let list = body_json(h.get("/api/v2/namespaces/ns/instances").await).await;
        started = list["data"].as_array().unwrap().len();
        if started == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(started, 1);

    let resp = h
        .send(
            Request::post("/api/v2/namespaces/ns/events/broadcast")
                .body(Body::from(r#"{"specversion":"0.3","id":"1","source":"s","type":"t"}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

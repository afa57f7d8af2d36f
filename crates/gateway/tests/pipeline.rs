//! Gateway requests end to end: router, plugin chain and the in-memory engine

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use direktiv_core::{FileKind, VarOwner};
use direktiv_engine::{Engine, EngineConfig, NoRuntime};
use direktiv_gateway::{router, EngineBackend, Gateway, GatewayConfig};
use direktiv_storage::Storage;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

const NS: &str = "ns";

struct Harness {
    engine: Engine,
    gateway: Arc<Gateway>,
}

impl Harness {
    async fn new() -> Self {
        let storage = Storage::memory();
        storage.namespaces.create_namespace(NS, false).await.unwrap();
        storage.namespaces.create_namespace("system", false).await.unwrap();
        let engine = Engine::new(EngineConfig::new("test-node"), storage, Arc::new(NoRuntime));
        engine.start();
        let backend = Arc::new(EngineBackend::new(engine.clone()));
        let gateway = Arc::new(Gateway::new(GatewayConfig::default(), backend));
        Self { engine, gateway }
    }

    async fn put(&self, ns: &str, path: &str, kind: FileKind, yaml: &str) {
        self.engine
            .storage()
            .files
            .create_file(ns, path, kind, "application/yaml", yaml.as_bytes().to_vec())
            .await
            .unwrap();
    }

    async fn endpoint(&self, path: &str, yaml: &str) {
        self.put(NS, path, FileKind::Endpoint, yaml).await;
        self.gateway.sync_namespace(NS).await.unwrap();
    }

    fn app(&self) -> Router {
        router(self.gateway.clone())
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }
}

async fn body_bytes(resp: Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(resp: Response) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

const HELLO: &str = r#"
direktiv_api: endpoint/v2
path: /hello
methods: [GET]
allow_anonymous: true
plugins:
  target:
    type: instant-response
    configuration:
      status_code: 201
      status_message: hello world
"#;

#[tokio::test]
async fn test_instant_response() {
    let h = Harness::new().await;
    h.endpoint("/hello.yaml", HELLO).await;

    let resp = h.get("/ns/ns/hello").await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(body_bytes(resp).await, b"hello world");
}

#[tokio::test]
async fn test_unknown_path_and_method() {
    let h = Harness::new().await;
    h.endpoint("/hello.yaml", HELLO).await;

    let resp = h.get("/ns/ns/nope").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = h.get("/ns/other/hello").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = h
        .send(Request::post("/ns/ns/hello").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "method_not_allowed");
}

#[tokio::test]
async fn test_key_auth_and_anonymous() {
    let h = Harness::new().await;
    h.put(
        NS,
        "/alice.yaml",
        FileKind::Consumer,
        "direktiv_api: consumer/v2\nusername: alice\napi_key: secret-key\ngroups: [admins]\n",
    )
    .await;
    h.endpoint(
        "/private.yaml",
        r#"
direktiv_api: endpoint/v2
path: /private
methods: [GET]
plugins:
  auth:
  - type: key-auth
    configuration:
      add_username_header: true
  inbound:
  - type: acl
    configuration:
      allow_groups: [admins]
  target:
    type: target-debug
"#,
    )
    .await;

    let resp = h.get("/ns/ns/private").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = h
        .send(
            Request::get("/ns/ns/private")
                .header("API-Token", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = h
        .send(
            Request::get("/ns/ns/private")
                .header("API-Token", "secret-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["consumer"]["Username"], "alice");

    let consumers = h.gateway.consumers(NS);
    assert_eq!(consumers.len(), 1);
    assert_eq!(consumers[0].username, "alice");
}

#[tokio::test]
async fn test_path_params_reach_the_target() {
    let h = Harness::new().await;
    h.endpoint(
        "/items.yaml",
        r#"
path: /items/{id}
methods: [GET, POST]
allow_anonymous: true
plugins:
  target:
    type: target-debug
"#,
    )
    .await;

    let resp = h.get("/ns/ns/items/42?verbose=1").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["url_params"]["id"], "42");
    assert_eq!(body["query_params"]["verbose"], "1");
}

#[tokio::test]
async fn test_pipeline_timeout() {
    let h = Harness::new().await;
    h.endpoint(
        "/slow.yaml",
        r#"
path: /slow
methods: [GET]
allow_anonymous: true
timeout: 1
plugins:
  inbound:
  - type: js-inbound
    configuration:
      script: "sleep(3);"
  target:
    type: instant-response
"#,
    )
    .await;

    let resp = h.get("/ns/ns/slow").await;
    assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body_json(resp).await["error"]["code"], "request_timeout");
}

#[tokio::test]
async fn test_misconfigured_endpoint_is_listed_and_answers_503() {
    let h = Harness::new().await;
    h.endpoint(
        "/broken.yaml",
        r#"
path: /broken
methods: [GET]
plugins:
  target:
    type: no-such-plugin
"#,
    )
    .await;

    let routes = h.gateway.routes(NS);
    assert_eq!(routes.len(), 1);
    assert!(!routes[0].errors.is_empty());
    assert_eq!(routes[0].server_path.as_deref(), Some("/ns/ns/broken"));

    let resp = h.get("/ns/ns/broken").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(resp).await["error"]["code"], "endpoint_misconfigured");
}

#[tokio::test]
async fn test_target_flow_sync_and_async() {
    let h = Harness::new().await;
    h.put(
        NS,
        "/answer.yaml",
        FileKind::Workflow,
        "states:\n- id: a\n  type: noop\n  transform: 'jq({result: 42})'\n",
    )
    .await;
    h.endpoint(
        "/sync.yaml",
        r#"
path: /sync
methods: [POST]
allow_anonymous: true
plugins:
  target:
    type: target-flow
    configuration:
      flow: /answer.yaml
"#,
    )
    .await;
    h.endpoint(
        "/async.yaml",
        r#"
path: /async
methods: [POST]
allow_anonymous: true
plugins:
  target:
    type: target-flow
    configuration:
      flow: /answer.yaml
      async: true
"#,
    )
    .await;

    let resp = h
        .send(Request::post("/ns/ns/sync").body(Body::from("{}")).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("direktiv-instance-id"));
    assert_eq!(body_json(resp).await, json!({"result": 42}));

    let resp = h
        .send(Request::post("/ns/ns/async").body(Body::from("{}")).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["data"]["namespace"], NS);
    assert_eq!(body["data"]["path"], "/answer.yaml");
}

#[tokio::test]
async fn test_target_flow_failure_headers() {
    let h = Harness::new().await;
    h.put(
        NS,
        "/fail.yaml",
        FileKind::Workflow,
        "states:\n- id: a\n  type: error\n  error: app.broken\n  message: nope\n",
    )
    .await;
    h.endpoint(
        "/fail-ep.yaml",
        r#"
path: /fail
methods: [GET]
allow_anonymous: true
plugins:
  target:
    type: target-flow
    configuration:
      flow: /fail.yaml
"#,
    )
    .await;

    let resp = h.get("/ns/ns/fail").await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        resp.headers().get("direktiv-instance-error-code").unwrap(),
        "app.broken"
    );
}

#[tokio::test]
async fn test_namespace_variable_target() {
    let h = Harness::new().await;
    h.engine
        .storage()
        .variables
        .set_variable(&VarOwner::namespace(NS), "greeting", "text/plain", b"hi there".to_vec())
        .await
        .unwrap();
    h.endpoint(
        "/var.yaml",
        r#"
path: /greeting
methods: [GET]
allow_anonymous: true
plugins:
  target:
    type: target-namespace-var
    configuration:
      variable: greeting
"#,
    )
    .await;

    let resp = h.get("/ns/ns/greeting").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
    assert_eq!(body_bytes(resp).await, b"hi there");
}

#[tokio::test]
async fn test_system_namespace_under_gw() {
    let h = Harness::new().await;
    h.engine
        .storage()
        .variables
        .set_variable(&VarOwner::namespace(NS), "shared", "application/json", b"{\"x\":1}".to_vec())
        .await
        .unwrap();
    h.put(
        "system",
        "/shared.yaml",
        FileKind::Endpoint,
        r#"
path: /shared
methods: [GET]
allow_anonymous: true
plugins:
  target:
    type: target-namespace-var
    configuration:
      namespace: ns
      variable: shared
"#,
    )
    .await;
    h.gateway.sync_namespace("system").await.unwrap();

    let resp = h.get("/gw/shared").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({"x": 1}));
    assert_eq!(
        h.gateway.routes("system")[0].server_path.as_deref(),
        Some("/gw/shared")
    );

    // the same target outside the system namespace may not leave its namespace
    h.endpoint(
        "/escape.yaml",
        r#"
path: /escape
methods: [GET]
allow_anonymous: true
plugins:
  target:
    type: target-namespace-var
    configuration:
      namespace: system
      variable: shared
"#,
    )
    .await;
    let resp = h.get("/ns/ns/escape").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_resync_swaps_table() {
    let h = Harness::new().await;
    h.endpoint("/hello.yaml", HELLO).await;
    assert_eq!(h.get("/ns/ns/hello").await.status(), StatusCode::CREATED);

    h.engine
        .storage()
        .files
        .update_file(NS, "/hello.yaml", None, HELLO.replace("/hello", "/moved").into_bytes())
        .await
        .unwrap();
    h.gateway.sync_namespace(NS).await.unwrap();

    assert_eq!(h.get("/ns/ns/hello").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(h.get("/ns/ns/moved").await.status(), StatusCode::CREATED);

    h.gateway.remove_namespace(NS);
    assert_eq!(h.get("/ns/ns/moved").await.status(), StatusCode::NOT_FOUND);
}

//! End-to-end workflow runs against the in-memory store

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use direktiv_core::{codes, FileKind, InstanceData, InstanceStatus, WorkflowError};
use direktiv_engine::{Engine, EngineConfig, FunctionCall, FunctionInvoker, NoRuntime, StartRequest};
use direktiv_events::CloudEvent;
use direktiv_storage::{InstanceFilter, Storage};
use serde_json::{json, Value};

const NS: &str = "ns";
const TIMEOUT: Duration = Duration::from_secs(20);

/// Invoker backed by a closure, counting calls
struct FnInvoker<F> {
    calls: AtomicUsize,
    f: F,
}

#[async_trait]
impl<F> FunctionInvoker for FnInvoker<F>
where
    F: Fn(usize, &FunctionCall) -> Result<Value, WorkflowError> + Send + Sync,
{
    async fn invoke(&self, call: FunctionCall) -> Result<Value, WorkflowError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.f)(n, &call)
    }
}

fn invoker<F>(f: F) -> Arc<FnInvoker<F>>
where
    F: Fn(usize, &FunctionCall) -> Result<Value, WorkflowError> + Send + Sync,
{
    Arc::new(FnInvoker {
        calls: AtomicUsize::new(0),
        f,
    })
}

async fn engine_with(invoker: Arc<dyn FunctionInvoker>) -> Engine {
    let storage = Storage::memory();
    storage.namespaces.create_namespace(NS, false).await.unwrap();
    let engine = Engine::new(EngineConfig::new("test-node"), storage, invoker);
    engine.start();
    engine
}

async fn engine() -> Engine {
    engine_with(Arc::new(NoRuntime)).await
}

async fn put(engine: &Engine, path: &str, yaml: &str) {
    engine
        .storage()
        .files
        .create_file(NS, path, FileKind::Workflow, "application/yaml", yaml.as_bytes().to_vec())
        .await
        .unwrap();
}

async fn run(engine: &Engine, path: &str, input: &[u8]) -> InstanceData {
    engine
        .run(StartRequest::new(NS, path, input.to_vec()), TIMEOUT)
        .await
        .unwrap()
}

fn output(inst: &InstanceData) -> Value {
    serde_json::from_slice(inst.output.as_deref().unwrap_or(b"null")).unwrap()
}

#[tokio::test]
async fn test_noop() {
    let engine = engine().await;
    put(&engine, "/noop.yaml", "states:\n- id: a\n  type: noop\n").await;

    let inst = run(&engine, "/noop.yaml", b"").await;
    assert_eq!(inst.status, InstanceStatus::Complete);
    assert_eq!(output(&inst), json!({"input": ""}));
    assert_eq!(inst.flow, vec!["a"]);
}

#[tokio::test]
async fn test_jq_log() {
    let engine = engine().await;
    let yaml = r#"
states:
- id: hello
  type: noop
  log: 'Hello, jq(.name)!'
"#;
    put(&engine, "/log.yaml", yaml).await;

    let inst = run(&engine, "/log.yaml", br#"{"name":"Direktiv"}"#).await;
    assert_eq!(inst.status, InstanceStatus::Complete);
    let logs = engine.logs(inst.id).await.unwrap();
    assert!(logs.iter().any(|l| l.message == "Hello, Direktiv!"));
}

#[tokio::test]
async fn test_switch_loop() {
    let engine = engine().await;
    let yaml = r#"
states:
- id: a
  type: noop
  transform: 'jq(.counter = 5)'
  transition: b
- id: b
  type: switch
  conditions:
  - condition: 'jq(.counter > 0)'
    transition: b
    transform: 'jq(.counter -= 1)'
  defaultTransition: c
- id: c
  type: noop
"#;
    put(&engine, "/loop.yaml", yaml).await;

    let inst = run(&engine, "/loop.yaml", b"{}").await;
    assert_eq!(inst.status, InstanceStatus::Complete);
    assert_eq!(inst.flow, vec!["a", "b", "b", "b", "b", "b", "b", "c"]);
    assert_eq!(output(&inst)["counter"], 0);
}

#[tokio::test]
async fn test_delay_accuracy() {
    let engine = engine().await;
    let yaml = r#"
states:
- id: a
  type: noop
  transform: 'jq(.start = now)'
  transition: b
- id: b
  type: delay
  duration: PT8S
  transition: c
- id: c
  type: switch
  conditions:
  - condition: 'jq(now - .start < 8)'
    transition: fail
  defaultTransition: e
- id: fail
  type: error
  error: delay.short
  message: woke up early
- id: e
  type: noop
"#;
    put(&engine, "/delay.yaml", yaml).await;

    let inst = run(&engine, "/delay.yaml", b"{}").await;
    assert_eq!(inst.status, InstanceStatus::Complete);
    assert_eq!(inst.flow.last().map(String::as_str), Some("e"));
    assert!(!inst.flow.iter().any(|s| s == "fail"));
}

#[tokio::test]
async fn test_events_xor_start() {
    let engine = engine().await;
    let yaml = r#"
start:
  type: eventsXor
  events:
  - type: a-checked
  - type: b-checked
states:
- id: a
  type: noop
"#;
    put(&engine, "/xor.yaml", yaml).await;
    assert_eq!(engine.sync_triggers(NS).await.unwrap(), 1);

    for kind in ["a-checked", "b-checked"] {
        let event = CloudEvent::new(kind, "tests").with_data(json!({ "from": kind }));
        engine.broadcast(NS, event).await.unwrap();
    }

    let mut finished = Vec::new();
    for _ in 0..100 {
        finished = engine
            .list(NS, &InstanceFilter::default())
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Complete)
            .collect();
        if finished.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(finished.len(), 2);
    let mut seen: Vec<String> = finished
        .iter()
        .map(|inst| {
            let out = output(inst);
            let (kind, event) = out.as_object().unwrap().iter().next().unwrap();
            assert_eq!(event["data"]["from"], json!(kind));
            kind.clone()
        })
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["a-checked", "b-checked"]);
}

#[tokio::test]
async fn test_container_action_result() {
    let invoker = invoker(|_n, call| Ok(json!({ "echo": call.input.clone() })));
    let engine = engine_with(invoker.clone()).await;
    let yaml = r#"
functions:
- id: echo
  type: knative-workflow
  image: direktiv/echo
states:
- id: call
  type: action
  action:
    function: echo
    input: 'jq({msg: .msg})'
"#;
    put(&engine, "/echo.yaml", yaml).await;

    let inst = run(&engine, "/echo.yaml", br#"{"msg":"hi"}"#).await;
    assert_eq!(inst.status, InstanceStatus::Complete);
    assert_eq!(output(&inst)["return"], json!({"echo": {"msg": "hi"}}));
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retries_then_catch() {
    let invoker = invoker(|_n, _call| {
        Err(WorkflowError::catchable("io.direktiv.command.error", "boom"))
    });
    let engine = engine_with(invoker.clone()).await;
    let yaml = r#"
functions:
- id: flaky
  type: knative-workflow
  image: direktiv/flaky
states:
- id: call
  type: action
  action:
    function: flaky
    retries:
      max_attempts: 2
      delay: PT0S
      codes: ["io\\.direktiv\\..*"]
  catch:
  - error: "io.direktiv.*"
    transition: handled
- id: handled
  type: noop
"#;
    put(&engine, "/flaky.yaml", yaml).await;

    let inst = run(&engine, "/flaky.yaml", b"{}").await;
    assert_eq!(inst.status, InstanceStatus::Complete);
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        output(&inst)["error"],
        json!({"code": "io.direktiv.command.error", "msg": "boom"})
    );
    assert_eq!(inst.flow, vec!["call", "call", "call", "handled"]);
}

#[tokio::test]
async fn test_uncaught_error_fails_instance() {
    let engine = engine().await;
    let yaml = r#"
states:
- id: boom
  type: error
  error: custom.failure
  message: 'bad value %s'
  args: ['jq(.value)']
"#;
    put(&engine, "/err.yaml", yaml).await;

    let inst = run(&engine, "/err.yaml", br#"{"value":7}"#).await;
    assert_eq!(inst.status, InstanceStatus::Failed);
    assert_eq!(inst.error_code.as_deref(), Some("custom.failure"));
    assert_eq!(inst.error_message.as_deref(), Some("bad value 7"));
}

#[tokio::test]
async fn test_subflow_result() {
    let engine = engine().await;
    put(
        &engine,
        "/lib/child.yaml",
        "states:\n- id: c\n  type: noop\n  transform: 'jq({doubled: (.n * 2)})'\n",
    )
    .await;
    let yaml = r#"
functions:
- id: child
  type: subflow
  workflow: child.yaml
states:
- id: call
  type: action
  action:
    function: child
    input: 'jq({n: .n})'
"#;
    put(&engine, "/lib/parent.yaml", yaml).await;

    let inst = run(&engine, "/lib/parent.yaml", br#"{"n":21}"#).await;
    assert_eq!(inst.status, InstanceStatus::Complete);
    assert_eq!(output(&inst)["return"], json!({"doubled": 42}));

    let children = engine.storage().instances.list_children(inst.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].depth, 1);
}

#[tokio::test]
async fn test_foreach_collects_results() {
    let invoker = invoker(|_n, call| Ok(json!(call.input["x"].as_i64().unwrap_or(0) + 1)));
    let engine = engine_with(invoker).await;
    let yaml = r#"
functions:
- id: inc
  type: knative-workflow
  image: direktiv/inc
states:
- id: each
  type: foreach
  array: 'jq([.items[] | {x: .}])'
  action:
    function: inc
"#;
    put(&engine, "/each.yaml", yaml).await;

    let inst = run(&engine, "/each.yaml", br#"{"items":[1,2,3]}"#).await;
    assert_eq!(inst.status, InstanceStatus::Complete);
    assert_eq!(output(&inst)["return"], json!([2, 3, 4]));
}

#[tokio::test]
async fn test_consume_event_resumes_instance() {
    let engine = engine().await;
    let yaml = r#"
states:
- id: wait
  type: consumeEvent
  event:
    type: com.example.ping
  timeout: PT1M
"#;
    put(&engine, "/wait.yaml", yaml).await;

    let inst = engine
        .start_instance(StartRequest::new(NS, "/wait.yaml", b"{}".to_vec()))
        .await
        .unwrap();
    for _ in 0..100 {
        if !engine.correlator().listeners(NS).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let event = CloudEvent::new("com.example.ping", "tests").with_data(json!({"pong": true}));
    engine.broadcast(NS, event).await.unwrap();

    let inst = engine.wait(inst.id, TIMEOUT).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Complete);
    assert_eq!(output(&inst)["com.example.ping"]["data"], json!({"pong": true}));
    assert!(engine.correlator().listeners(NS).is_empty());
}

#[tokio::test]
async fn test_variables_round_trip() {
    let engine = engine().await;
    let yaml = r#"
states:
- id: set
  type: setter
  variables:
  - key: counter
    scope: workflow
    value: 'jq(.start)'
  transition: get
- id: get
  type: getter
  variables:
  - key: counter
    scope: workflow
    as: found
"#;
    put(&engine, "/vars.yaml", yaml).await;

    let inst = run(&engine, "/vars.yaml", br#"{"start":{"n":3}}"#).await;
    assert_eq!(inst.status, InstanceStatus::Complete);
    assert_eq!(output(&inst)["var"]["found"], json!({"n": 3}));
}

#[tokio::test]
async fn test_cancel_waiting_instance() {
    let engine = engine().await;
    put(
        &engine,
        "/sleep.yaml",
        "states:\n- id: s\n  type: delay\n  duration: PT1H\n",
    )
    .await;

    let inst = engine
        .start_instance(StartRequest::new(NS, "/sleep.yaml", vec![]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.cancel(inst.id).await.unwrap();

    let inst = engine.wait(inst.id, TIMEOUT).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Cancelled);
    assert_eq!(inst.error_code.as_deref(), Some(codes::CANCELLED_API));
}

#[tokio::test]
async fn test_subflow_depth_limit_is_uncatchable() {
    let storage = Storage::memory();
    storage.namespaces.create_namespace(NS, false).await.unwrap();
    let engine = Engine::new(
        EngineConfig::new("test-node").with_max_depth(2),
        storage,
        Arc::new(NoRuntime),
    );
    engine.start();
    let yaml = r#"
functions:
- id: self
  type: subflow
  workflow: /rec.yaml
states:
- id: call
  type: action
  action:
    function: self
  catch:
  - error: "*"
"#;
    put(&engine, "/rec.yaml", yaml).await;

    let inst = run(&engine, "/rec.yaml", b"{}").await;
    assert_eq!(inst.status, InstanceStatus::Failed);
    assert_eq!(inst.error_code.as_deref(), Some(codes::LIMITS_DEPTH));
}

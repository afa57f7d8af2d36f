use direktiv_sidecar::{ActionContext, CommandRequest, CommandSpec, Executor, SidecarConfig};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_stop_on_error_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/log"))
        .and(query_param("aid", "action-1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = ActionContext {
        action_id: "action-1".into(),
        temp_dir: dir.path().to_path_buf(),
    };
    let executor = Executor::new(
        SidecarConfig::default()
            .with_stdout(false)
            .with_http_backend(server.uri()),
    );
    let request = CommandRequest {
        commands: vec![
            CommandSpec::new("echo hello1").with_stop(true),
            CommandSpec::new("does not exist").with_stop(true),
            CommandSpec::new("echo hello2"),
        ],
    };

    let run = executor.execute(&ctx, &request).await.unwrap();
    assert_eq!(run.results.len(), 2);
    assert!(run.log.ends_with(
        "hello1\nrunning command 'does not exist'\nexec: \"does\": executable file not found in $PATH\n"
    ));
    assert!(!run.log.contains("hello2"));

    // Everything logged also reached the backend
    let posted: String = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .collect();
    assert_eq!(posted, run.log);
}

#[tokio::test]
async fn test_dev_mode_skips_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = ActionContext {
        action_id: "action-2".into(),
        temp_dir: dir.path().to_path_buf(),
    };
    let executor = Executor::new(
        SidecarConfig::default()
            .with_stdout(false)
            .with_http_backend(server.uri())
            .with_dev_mode(true),
    );
    let request = CommandRequest {
        commands: vec![CommandSpec::new("echo quiet")],
    };
    let run = executor.execute(&ctx, &request).await.unwrap();
    assert_eq!(run.results[0].output, "quiet\n");
}

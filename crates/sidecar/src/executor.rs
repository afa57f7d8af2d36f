//! Command executor
//!
//! Runs the commands of one request in order inside the action's working
//! directory. Each attempted command yields a [`CommandResult`]; a failure is
//! recorded and execution continues unless the command set `stop`.

use std::path::PathBuf;
use std::process::Stdio;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::command::{CommandRequest, CommandResult, CommandSpec};
use crate::error::ExecError;
use crate::log::{ActionLog, LogBackend};
use crate::parse::parse_command;

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub port: u16,
    /// Flow endpoint receiving action logs
    pub http_backend: Option<String>,
    /// Skip posting logs to the backend
    pub dev_mode: bool,
    /// Echo action logs on the process stdout
    pub stdout: bool,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            port: 8890,
            http_backend: None,
            dev_mode: false,
            stdout: true,
        }
    }
}

impl SidecarConfig {
    pub fn from_config(config: &direktiv_core::Config) -> Self {
        Self {
            port: config.sidecar_port,
            http_backend: config.http_backend.clone(),
            dev_mode: config.dev_mode,
            stdout: true,
        }
    }

    pub fn with_http_backend(mut self, backend: impl Into<String>) -> Self {
        self.http_backend = Some(backend.into());
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    pub fn with_stdout(mut self, stdout: bool) -> Self {
        self.stdout = stdout;
        self
    }
}

/// Per-request context taken from the request headers
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub action_id: String,
    pub temp_dir: PathBuf,
}

/// Results of a request plus everything that was logged
#[derive(Debug, Clone)]
pub struct Execution {
    pub results: Vec<CommandResult>,
    pub log: String,
}

pub struct Executor {
    config: SidecarConfig,
    client: reqwest::Client,
}

impl Executor {
    pub fn new(config: SidecarConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    fn backend(&self) -> Option<LogBackend> {
        if self.config.dev_mode {
            return None;
        }
        self.config
            .http_backend
            .as_ref()
            .map(|url| LogBackend::new(self.client.clone(), url.clone()))
    }

    #[instrument(skip(self, request), fields(action_id = %ctx.action_id))]
    pub async fn execute(
        &self,
        ctx: &ActionContext,
        request: &CommandRequest,
    ) -> Result<Execution, ExecError> {
        if !ctx.temp_dir.is_dir() {
            return Err(ExecError::BadRequest(format!(
                "working directory {} does not exist",
                ctx.temp_dir.display()
            )));
        }
        let log = ActionLog::new(&ctx.action_id, self.config.stdout, self.backend());
        let mut results = Vec::with_capacity(request.commands.len());
        let mut failure = None;

        for (index, spec) in request.commands.iter().enumerate() {
            match run_command(index, spec, ctx, &log).await {
                Ok(result) => {
                    let abort = result.error.is_some() && spec.stop;
                    results.push(result);
                    if abort {
                        info!(index, "command failed, stopping");
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let log = log.finish().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(Execution { results, log }),
        }
    }
}

async fn run_command(
    index: usize,
    spec: &CommandSpec,
    ctx: &ActionContext,
    log: &ActionLog,
) -> Result<CommandResult, ExecError> {
    if spec.suppress_command {
        log.line(&format!("running command {index}"));
    } else {
        log.line(&format!("running command '{}'", spec.command));
    }

    let words = parse_command(&spec.command, &spec.envs, &ctx.temp_dir).await?;
    let Some((bin, args)) = words.split_first() else {
        return Err(ExecError::BadRequest(format!("command {index} is empty")));
    };

    let spawned = Command::new(bin)
        .args(args)
        .current_dir(&ctx.temp_dir)
        .env("HOME", &ctx.temp_dir)
        .envs(spec.envs.iter().map(|e| (e.name.as_str(), e.value.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let message = spawn_error(bin, &e);
            log.line(&message);
            return Ok(CommandResult {
                error: Some(message),
                output: String::new(),
            });
        }
    };

    let output = Mutex::new(String::new());
    let forward = !spec.suppress_output;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        pump(stdout, &output, forward.then_some(log)),
        pump(stderr, &output, forward.then_some(log)),
    );

    let status = child.wait().await?;
    let output = output.into_inner();
    debug!(index, %status, "command finished");

    if status.success() {
        return Ok(CommandResult {
            error: None,
            output,
        });
    }
    let message = match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "signal: killed".to_string(),
    };
    log.line(&message);
    Ok(CommandResult {
        error: Some(message),
        output,
    })
}

async fn pump<R>(stream: Option<R>, output: &Mutex<String>, log: Option<&ActionLog>)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else { return };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        {
            let mut out = output.lock();
            out.push_str(&line);
            out.push('\n');
        }
        if let Some(log) = log {
            log.line(&line);
        }
    }
}

fn spawn_error(bin: &str, err: &std::io::Error) -> String {
    if err.kind() == std::io::ErrorKind::NotFound && !bin.contains('/') {
        format!("exec: \"{bin}\": executable file not found in $PATH")
    } else {
        format!("fork/exec {bin}: {err}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, ActionContext, Executor) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ActionContext {
            action_id: "test".into(),
            temp_dir: dir.path().to_path_buf(),
        };
        let executor = Executor::new(SidecarConfig::default().with_stdout(false));
        (dir, ctx, executor)
    }

    fn request(commands: Vec<CommandSpec>) -> CommandRequest {
        CommandRequest { commands }
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let (_dir, ctx, executor) = setup();
        let run = executor
            .execute(
                &ctx,
                &request(vec![CommandSpec::new("echo one"), CommandSpec::new("echo two")]),
            )
            .await
            .unwrap();
        assert_eq!(run.results.len(), 2);
        assert_eq!(run.results[0].output, "one\n");
        assert_eq!(
            run.log,
            "running command 'echo one'\none\nrunning command 'echo two'\ntwo\n"
        );
    }

    #[tokio::test]
    async fn test_failure_without_stop_continues() {
        let (_dir, ctx, executor) = setup();
        let run = executor
            .execute(
                &ctx,
                &request(vec![CommandSpec::new("false"), CommandSpec::new("echo after")]),
            )
            .await
            .unwrap();
        assert_eq!(run.results[0].error.as_deref(), Some("exit status 1"));
        assert_eq!(run.results[1].output, "after\n");
    }

    #[tokio::test]
    async fn test_suppression() {
        let (_dir, ctx, executor) = setup();
        let run = executor
            .execute(
                &ctx,
                &request(vec![CommandSpec::new("echo secret").suppressed(true, true)]),
            )
            .await
            .unwrap();
        assert_eq!(run.log, "running command 0\n");
        assert_eq!(run.results[0].output, "secret\n");
    }

    #[tokio::test]
    async fn test_env_and_home() {
        let (dir, ctx, executor) = setup();
        let run = executor
            .execute(
                &ctx,
                &request(vec![
                    CommandSpec::new("sh -c 'echo $GREETING; pwd; echo $HOME'")
                        .with_env("GREETING", "hi"),
                ]),
            )
            .await
            .unwrap();
        let home = dir.path().canonicalize().unwrap();
        let lines: Vec<&str> = run.results[0].output.lines().collect();
        assert_eq!(lines[0], "hi");
        assert_eq!(std::path::Path::new(lines[1]).canonicalize().unwrap(), home);
    }

    #[tokio::test]
    async fn test_empty_command_is_bad_request() {
        let (_dir, ctx, executor) = setup();
        let err = executor
            .execute(&ctx, &request(vec![CommandSpec::new("  ")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_missing_working_dir() {
        let (_dir, mut ctx, executor) = setup();
        ctx.temp_dir = ctx.temp_dir.join("missing");
        assert!(matches!(
            executor.execute(&ctx, &request(vec![])).await,
            Err(ExecError::BadRequest(_))
        ));
    }
}

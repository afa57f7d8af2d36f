// Action log fan-out
//
// Every line goes to the buffer returned with the response, to stdout when
// enabled, and to the flow log backend unless running in dev mode.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where action logs are posted
#[derive(Debug, Clone)]
pub struct LogBackend {
    client: reqwest::Client,
    base_url: String,
}

impl LogBackend {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self, action_id: &str) -> String {
        format!("{}/log?aid={}", self.base_url, action_id)
    }

    async fn post(&self, action_id: &str, body: String) {
        let result = self
            .client
            .post(self.url(action_id))
            .header("content-type", "text/plain")
            .body(body)
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(action_id, status = %resp.status(), "log backend rejected lines")
            }
            Err(e) => warn!(action_id, error = %e, "posting action log failed"),
            Ok(_) => {}
        }
    }
}

pub struct ActionLog {
    buffer: Mutex<String>,
    stdout: bool,
    remote: Option<mpsc::UnboundedSender<String>>,
    forwarder: Option<JoinHandle<()>>,
}

impl ActionLog {
    pub fn new(action_id: &str, stdout: bool, backend: Option<LogBackend>) -> Self {
        let (remote, forwarder) = match backend {
            Some(backend) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = tokio::spawn(forward(action_id.to_string(), backend, rx));
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };
        Self {
            buffer: Mutex::new(String::new()),
            stdout,
            remote,
            forwarder,
        }
    }

    pub fn line(&self, line: &str) {
        let mut text = String::with_capacity(line.len() + 1);
        text.push_str(line);
        text.push('\n');
        if self.stdout {
            print!("{text}");
        }
        if let Some(remote) = &self.remote {
            let _ = remote.send(text.clone());
        }
        self.buffer.lock().push_str(&text);
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }

    /// Wait until every line reached the backend; returns the buffer
    pub async fn finish(mut self) -> String {
        drop(self.remote.take());
        if let Some(handle) = self.forwarder.take() {
            let _ = handle.await;
        }
        self.buffer.into_inner()
    }
}

async fn forward(action_id: String, backend: LogBackend, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(first) = rx.recv().await {
        let mut batch = first;
        while let Ok(more) = rx.try_recv() {
            batch.push_str(&more);
        }
        backend.post(&action_id, batch).await;
    }
    debug!(%action_id, "log forwarder finished");
}

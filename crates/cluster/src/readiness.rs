// Startup readiness probe

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::BusError;

/// How long a node waits for its daemon before giving up
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Path of the readiness endpoint on the admin port
pub const PING_PATH: &str = "/ping";

/// Poll `probe` until it reports ready or `timeout` elapses
pub async fn wait_ready<F, Fut>(mut probe: F, timeout: Duration) -> Result<(), BusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        let mut interval = tokio::time::interval(Duration::from_millis(250));
        loop {
            interval.tick().await;
            if probe().await {
                return;
            }
            debug!("bus not ready yet");
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| BusError::StartupTimeout(timeout))
}

/// Probe `GET http://<address>/ping` for a body of exactly `OK`
pub async fn http_ready(client: &reqwest::Client, address: &str, timeout: Duration) -> Result<(), BusError> {
    let url = format!("http://{address}{PING_PATH}");
    wait_ready(
        || async {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    resp.text().await.map(|b| b.trim() == "OK").unwrap_or(false)
                }
                _ => false,
            }
        },
        timeout,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_a_few_polls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        wait_ready(
            move || {
                let c = c.clone();
                async move { c.fetch_add(1, Ordering::SeqCst) >= 3 }
            },
            READY_TIMEOUT,
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out() {
        let err = wait_ready(|| async { false }, READY_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, BusError::StartupTimeout(d) if d == READY_TIMEOUT));
    }

    #[tokio::test]
    async fn test_http_probe_accepts_ok_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PING_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&server)
            .await;

        let address = server.uri().trim_start_matches("http://").to_string();
        http_ready(&reqwest::Client::new(), &address, Duration::from_secs(5))
            .await
            .unwrap();
    }
}

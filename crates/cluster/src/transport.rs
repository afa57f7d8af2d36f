// Peer transports
// Decision: Nodes exchange JSON frames over HTTP; tests wire nodes through an in-process network
// Decision: A transport only sends; receiving is Bus::handle_frame, called by the HTTP route or the local inbox

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::message::WireMessage;

/// Path of the frame endpoint on the daemon port
pub const FRAME_PATH: &str = "/bus";

/// Sends frames to a peer address
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, address: &str, frame: WireMessage) -> Result<(), BusError>;
}

// ============================================================================
// HTTP
// ============================================================================

/// POSTs frames to `http://<address>/bus`
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, BusError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn send(&self, address: &str, frame: WireMessage) -> Result<(), BusError> {
        let url = format!("http://{address}{FRAME_PATH}");
        let response = self
            .client
            .post(&url)
            .json(&frame)
            .send()
            .await
            .map_err(|e| BusError::Transport(format!("{address}: {e}")))?;
        if !response.status().is_success() {
            return Err(BusError::Transport(format!(
                "{address}: status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// In-process
// ============================================================================

/// A set of in-process nodes addressed by name
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inboxes: Arc<DashMap<String, mpsc::UnboundedSender<WireMessage>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an address and return its inbox
    pub fn attach(&self, address: &str) -> mpsc::UnboundedReceiver<WireMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(address.to_string(), tx);
        rx
    }

    /// Remove an address; later sends to it fail
    pub fn detach(&self, address: &str) {
        self.inboxes.remove(address);
    }

    pub fn transport(&self) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct LocalTransport {
    network: LocalNetwork,
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn send(&self, address: &str, frame: WireMessage) -> Result<(), BusError> {
        let inbox = self
            .network
            .inboxes
            .get(address)
            .map(|tx| tx.clone())
            .ok_or_else(|| BusError::Transport(format!("{address}: unreachable")))?;
        inbox
            .send(frame)
            .map_err(|_| BusError::Transport(format!("{address}: inbox closed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BusMessage;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn frame() -> WireMessage {
        WireMessage::Deliver {
            channels: vec!["c".into()],
            message: BusMessage::new("t", "a", b"x".to_vec()),
        }
    }

    #[tokio::test]
    async fn test_local_delivery_and_unreachable() {
        let net = LocalNetwork::new();
        let mut rx = net.attach("b");
        let transport = net.transport();

        transport.send("b", frame()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(WireMessage::Deliver { .. })));

        net.detach("b");
        assert!(matches!(
            transport.send("b", frame()).await,
            Err(BusError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_http_posts_frame() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(FRAME_PATH))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let address = server.uri().trim_start_matches("http://").to_string();
        HttpTransport::new(Duration::from_secs(5))
            .unwrap()
            .send(&address, frame())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_error_status_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let address = server.uri().trim_start_matches("http://").to_string();
        let err = HttpTransport::new(Duration::from_secs(5))
            .unwrap()
            .send(&address, frame())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Transport(_)));
    }
}

// Docker engine back-end
// Decision: One container per service, named by the service id; scale is not honoured
// Decision: Updates recreate the container since docker cannot change an image in place

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ReconcileError;
use crate::runtime::{labels, LogStream, PodInfo, RuntimeClient, RuntimeService};
use crate::service::{service_url, ServiceDefinition};

#[derive(Clone)]
pub struct DockerClient {
    client: Client,
    host: String,
    network: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    status: String,
}

impl ContainerSummary {
    fn id(&self) -> Option<String> {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
    }
}

impl DockerClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            host: host.into().trim_end_matches('/').to_string(),
            network: None,
        }
    }

    /// Attach service containers to a user-defined network so ids resolve as host names
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, ReconcileError> {
        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        if status == 404 {
            return Err(ReconcileError::NotFound(message));
        }
        Err(ReconcileError::Runtime { status, message })
    }

    async fn containers(&self) -> Result<Vec<ContainerSummary>, ReconcileError> {
        let filters = json!({"label": [format!("{}=true", labels::MANAGED)]}).to_string();
        let resp = self
            .send(
                self.client
                    .get(format!("{}/containers/json", self.host))
                    .query(&[("all", "true"), ("filters", filters.as_str())]),
            )
            .await?;
        resp.json()
            .await
            .map_err(|e| ReconcileError::Decode(e.to_string()))
    }

    fn create_body(&self, service: &ServiceDefinition) -> serde_json::Value {
        let env: Vec<String> = service
            .envs
            .iter()
            .map(|e| format!("{}={}", e.name, e.value))
            .collect();
        let (_, memory) = service.size.limits();
        let mut body = json!({
            "Image": service.image,
            "Env": env,
            "Labels": {
                (labels::MANAGED): "true",
                (labels::VALUE_HASH): service.value_hash(),
                (labels::NAMESPACE): service.namespace,
                (labels::TYPE): service.typ.to_string(),
                (labels::PATH): service.path,
                (labels::NAME): service.name,
            },
            "HostConfig": {
                "Memory": u64::from(memory) * 1024 * 1024,
                "NetworkMode": self.network.clone().unwrap_or_else(|| "bridge".to_string()),
            }
        });
        if !service.cmd.is_empty() {
            body["Cmd"] = json!(["/bin/sh", "-c", service.cmd]);
        }
        body
    }
}

#[async_trait]
impl RuntimeClient for DockerClient {
    async fn list(&self) -> Result<Vec<RuntimeService>, ReconcileError> {
        Ok(self
            .containers()
            .await?
            .into_iter()
            .filter_map(|c| {
                Some(RuntimeService {
                    id: c.id()?,
                    value_hash: c.labels.get(labels::VALUE_HASH).cloned().unwrap_or_default(),
                    ready: c.state == "running",
                    message: (c.state != "running").then(|| c.status.clone()),
                })
            })
            .collect())
    }

    async fn create(&self, service: &ServiceDefinition) -> Result<(), ReconcileError> {
        let id = service.id();
        debug!(%id, image = %service.image, "creating docker container");
        self.send(
            self.client
                .post(format!("{}/containers/create", self.host))
                .query(&[("name", id.as_str())])
                .json(&self.create_body(service)),
        )
        .await?;
        self.send(self.client.post(format!("{}/containers/{id}/start", self.host)))
            .await?;
        Ok(())
    }

    async fn update(&self, service: &ServiceDefinition) -> Result<(), ReconcileError> {
        self.delete(&service.id()).await?;
        self.create(service).await
    }

    async fn delete(&self, id: &str) -> Result<(), ReconcileError> {
        debug!(%id, "removing docker container");
        self.send(
            self.client
                .delete(format!("{}/containers/{id}", self.host))
                .query(&[("force", "true")]),
        )
        .await?;
        Ok(())
    }

    async fn pods(&self, id: &str) -> Result<Vec<PodInfo>, ReconcileError> {
        let container = self
            .containers()
            .await?
            .into_iter()
            .find(|c| c.id().as_deref() == Some(id))
            .ok_or_else(|| ReconcileError::NotFound(id.to_string()))?;
        Ok(vec![PodInfo {
            name: id.to_string(),
            status: container.state,
            started_at: None,
        }])
    }

    async fn logs(&self, id: &str, _pod: &str) -> Result<LogStream, ReconcileError> {
        let resp = self
            .send(
                self.client
                    .get(format!("{}/containers/{id}/logs", self.host))
                    .query(&[("stdout", "1"), ("stderr", "1"), ("follow", "1")]),
            )
            .await?;
        Ok(Box::pin(
            resp.bytes_stream().map(|r| r.map_err(ReconcileError::from)),
        ))
    }

    async fn kill_pod(&self, id: &str, _pod: &str) -> Result<(), ReconcileError> {
        self.send(self.client.post(format!("{}/containers/{id}/restart", self.host)))
            .await?;
        Ok(())
    }

    fn url(&self, id: &str) -> String {
        service_url(direktiv_core::FunctionsBackend::Docker, "", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceSize, ServiceType};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn def() -> ServiceDefinition {
        ServiceDefinition {
            namespace: "ns".into(),
            typ: ServiceType::Workflow,
            path: "/wf.yaml".into(),
            name: "echo".into(),
            image: "direktiv/echo".into(),
            cmd: "serve --port 80".into(),
            size: ServiceSize::Small,
            scale: 1,
            envs: vec![],
        }
    }

    #[tokio::test]
    async fn test_list_reads_labels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Names": ["/obj-1"], "Labels": {"direktiv.io/input-hash": "h1"}, "State": "running", "Status": "Up"},
                {"Names": ["/obj-2"], "Labels": {}, "State": "exited", "Status": "Exited (1)"}
            ])))
            .mount(&server)
            .await;

        let list = DockerClient::new(server.uri()).list().await.unwrap();
        assert_eq!(list[0].id, "obj-1");
        assert_eq!(list[0].value_hash, "h1");
        assert!(list[0].ready);
        assert_eq!(list[1].message.as_deref(), Some("Exited (1)"));
    }

    #[tokio::test]
    async fn test_create_then_start() {
        let server = MockServer::start().await;
        let id = def().id();
        Mock::given(method("POST"))
            .and(path("/containers/create"))
            .and(query_param("name", id.as_str()))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"Id": "abc"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/containers/{id}/start")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        DockerClient::new(server.uri()).create(&def()).await.unwrap();
    }

    #[test]
    fn test_create_body() {
        let body = DockerClient::new("http://d").with_network("direktiv").create_body(&def());
        assert_eq!(body["Cmd"], json!(["/bin/sh", "-c", "serve --port 80"]));
        assert_eq!(body["HostConfig"]["NetworkMode"], "direktiv");
        assert_eq!(body["Labels"]["direktiv.io/name"], "echo");
    }
}

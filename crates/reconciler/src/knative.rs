//! Knative serving back-end
//!
//! Talks to the Kubernetes API directly. Every managed service carries the
//! `direktiv.io/managed` label; its value hash lives in an annotation so the
//! reconciler can diff without reading the full spec back.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ReconcileError;
use crate::runtime::{labels, LogStream, PodInfo, RuntimeClient, RuntimeService};
use crate::service::{service_url, ServiceDefinition};

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const CONTAINER_NAME: &str = "direktiv-container";
const SIDECAR_IMAGE: &str = "direktiv/direktiv:latest";
const SIDECAR_PORT: u16 = 8890;

#[derive(Clone)]
pub struct KnativeClient {
    client: Client,
    api: String,
    namespace: String,
    token: Option<String>,
    sidecar_image: String,
}

impl KnativeClient {
    pub fn new(api: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api: api.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            token: None,
            sidecar_image: SIDECAR_IMAGE.to_string(),
        }
    }

    /// In-cluster client using the mounted service account token
    pub fn in_cluster(api: impl Into<String>, namespace: impl Into<String>) -> Self {
        let token = std::fs::read_to_string(TOKEN_PATH)
            .ok()
            .map(|t| t.trim().to_string());
        Self::new(api, namespace).with_token(token)
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_sidecar_image(mut self, image: impl Into<String>) -> Self {
        self.sidecar_image = image.into();
        self
    }

    fn services_url(&self) -> String {
        format!(
            "{}/apis/serving.knative.dev/v1/namespaces/{}/services",
            self.api, self.namespace
        )
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.api, self.namespace)
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, ReconcileError> {
        let resp = self.auth(req).send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        Err(ReconcileError::Runtime { status, message })
    }

    /// Knative Service object for a definition
    pub fn manifest(&self, service: &ServiceDefinition) -> Value {
        let id = service.id();
        let (cpu, memory) = service.size.limits();
        let env: Vec<Value> = service
            .envs
            .iter()
            .map(|e| json!({"name": e.name, "value": e.value}))
            .collect();
        let mut container = json!({
            "name": CONTAINER_NAME,
            "image": service.image,
            "env": env,
            "resources": {
                "limits": {"cpu": format!("{cpu}m"), "memory": format!("{memory}Mi")}
            }
        });
        if !service.cmd.is_empty() {
            container["command"] = json!(["/bin/sh", "-c", service.cmd]);
        }

        json!({
            "apiVersion": "serving.knative.dev/v1",
            "kind": "Service",
            "metadata": {
                "name": id,
                "namespace": self.namespace,
                "labels": {
                    (labels::MANAGED): "true",
                    (labels::NAMESPACE): service.namespace,
                    (labels::TYPE): service.typ.to_string(),
                },
                "annotations": {
                    (labels::VALUE_HASH): service.value_hash(),
                    (labels::PATH): service.path,
                    (labels::NAME): service.name,
                }
            },
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            "autoscaling.knative.dev/minScale": service.scale.to_string()
                        }
                    },
                    "spec": {
                        "containers": [
                            {
                                "name": "direktiv-sidecar",
                                "image": self.sidecar_image,
                                "env": [{"name": "DIREKTIV_APP", "value": "sidecar"}],
                                "ports": [{"containerPort": SIDECAR_PORT}]
                            },
                            container
                        ]
                    }
                }
            }
        })
    }
}

fn parse_service(item: &Value) -> Option<RuntimeService> {
    let meta = item.get("metadata")?;
    let id = meta.get("name")?.as_str()?.to_string();
    let value_hash = meta
        .pointer(&format!("/annotations/{}", labels::VALUE_HASH.replace('/', "~1")))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let conditions = item
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let ready = conditions.iter().find(|c| c["type"] == "Ready");
    Some(RuntimeService {
        id,
        value_hash,
        ready: ready.is_some_and(|c| c["status"] == "True"),
        message: ready
            .and_then(|c| c.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[async_trait]
impl RuntimeClient for KnativeClient {
    async fn list(&self) -> Result<Vec<RuntimeService>, ReconcileError> {
        let resp = self
            .send(
                self.client
                    .get(self.services_url())
                    .query(&[("labelSelector", format!("{}=true", labels::MANAGED))]),
            )
            .await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ReconcileError::Decode(e.to_string()))?;
        Ok(body["items"]
            .as_array()
            .map(|items| items.iter().filter_map(parse_service).collect())
            .unwrap_or_default())
    }

    async fn create(&self, service: &ServiceDefinition) -> Result<(), ReconcileError> {
        debug!(id = %service.id(), "creating knative service");
        self.send(self.client.post(self.services_url()).json(&self.manifest(service)))
            .await?;
        Ok(())
    }

    async fn update(&self, service: &ServiceDefinition) -> Result<(), ReconcileError> {
        let id = service.id();
        debug!(%id, "updating knative service");
        self.send(
            self.client
                .patch(format!("{}/{id}", self.services_url()))
                .header("content-type", "application/merge-patch+json")
                .body(self.manifest(service).to_string()),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), ReconcileError> {
        debug!(%id, "deleting knative service");
        match self
            .send(self.client.delete(format!("{}/{id}", self.services_url())))
            .await
        {
            Ok(_) => Ok(()),
            Err(ReconcileError::Runtime { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(ReconcileError::NotFound(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn pods(&self, id: &str) -> Result<Vec<PodInfo>, ReconcileError> {
        let resp = self
            .send(
                self.client
                    .get(self.pods_url())
                    .query(&[("labelSelector", format!("serving.knative.dev/service={id}"))]),
            )
            .await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ReconcileError::Decode(e.to_string()))?;
        Ok(body["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|p| {
                        Some(PodInfo {
                            name: p.pointer("/metadata/name")?.as_str()?.to_string(),
                            status: p
                                .pointer("/status/phase")
                                .and_then(Value::as_str)
                                .unwrap_or("Unknown")
                                .to_string(),
                            started_at: p
                                .pointer("/status/startTime")
                                .and_then(Value::as_str)
                                .and_then(|s| s.parse().ok()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn logs(&self, _id: &str, pod: &str) -> Result<LogStream, ReconcileError> {
        let resp = self
            .send(
                self.client
                    .get(format!("{}/{pod}/log", self.pods_url()))
                    .query(&[("container", CONTAINER_NAME), ("follow", "true")]),
            )
            .await?;
        Ok(Box::pin(
            resp.bytes_stream().map(|r| r.map_err(ReconcileError::from)),
        ))
    }

    async fn kill_pod(&self, _id: &str, pod: &str) -> Result<(), ReconcileError> {
        self.send(self.client.delete(format!("{}/{pod}", self.pods_url())))
            .await?;
        Ok(())
    }

    fn url(&self, id: &str) -> String {
        service_url(direktiv_core::FunctionsBackend::Knative, &self.namespace, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceSize, ServiceType};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn def() -> ServiceDefinition {
        ServiceDefinition {
            namespace: "ns".into(),
            typ: ServiceType::Namespace,
            path: "/svc.yaml".into(),
            name: String::new(),
            image: "direktiv/echo".into(),
            cmd: String::new(),
            size: ServiceSize::Medium,
            scale: 2,
            envs: vec![],
        }
    }

    #[tokio::test]
    async fn test_list_parses_hash_and_readiness() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/serving.knative.dev/v1/namespaces/svc/services"))
            .and(query_param("labelSelector", "direktiv.io/managed=true"))
            .and(header("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{
                    "metadata": {"name": "obj-1", "annotations": {"direktiv.io/input-hash": "abc"}},
                    "status": {"conditions": [{"type": "Ready", "status": "True"}]}
                }, {
                    "metadata": {"name": "obj-2"},
                    "status": {"conditions": [{"type": "Ready", "status": "False", "message": "image pull"}]}
                }]
            })))
            .mount(&server)
            .await;

        let client = KnativeClient::new(server.uri(), "svc").with_token(Some("t0ken".into()));
        let list = client.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].value_hash, "abc");
        assert!(list[0].ready);
        assert!(!list[1].ready);
        assert_eq!(list[1].message.as_deref(), Some("image pull"));
    }

    #[tokio::test]
    async fn test_create_posts_manifest() {
        let server = MockServer::start().await;
        let d = def();
        Mock::given(method("POST"))
            .and(path("/apis/serving.knative.dev/v1/namespaces/svc/services"))
            .and(body_partial_json(json!({
                "metadata": {"name": d.id(), "annotations": {"direktiv.io/input-hash": d.value_hash()}}
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        KnativeClient::new(server.uri(), "svc").create(&d).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let err = KnativeClient::new(server.uri(), "svc")
            .delete("obj-x")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound(_)));
    }

    #[test]
    fn test_manifest_resources_and_scale() {
        let m = KnativeClient::new("http://k", "svc").manifest(&def());
        assert_eq!(
            m.pointer("/spec/template/metadata/annotations/autoscaling.knative.dev~1minScale"),
            Some(&json!("2"))
        );
        let containers = m.pointer("/spec/template/spec/containers").unwrap();
        assert_eq!(containers[1]["resources"]["limits"]["memory"], "512Mi");
        assert_eq!(containers[0]["env"][0]["value"], "sidecar");
    }
}

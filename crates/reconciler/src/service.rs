//! Service definitions and identity
//!
//! A service is declared either by a namespace service file or by a
//! `container` function inside a workflow. Its id hashes where it was
//! declared (namespace, name, type, path) so it survives content edits;
//! the value hash covers what it runs (image, cmd, size, scale).

use std::fmt;

use direktiv_core::manifest::ServiceFile;
use direktiv_core::workflow::{EnvVar, FunctionKind, Workflow};
use direktiv_core::FunctionsBackend;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex characters of the digest kept in ids; ids must stay valid DNS labels
const ID_HASH_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    #[serde(rename = "namespace-service")]
    Namespace,
    #[serde(rename = "workflow-service")]
    Workflow,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceType::Namespace => f.write_str("namespace-service"),
            ServiceType::Workflow => f.write_str("workflow-service"),
        }
    }
}

/// Resource class of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceSize {
    #[default]
    Small,
    Medium,
    Large,
}

impl ServiceSize {
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(|s| s.trim().to_lowercase()).as_deref() {
            Some("medium") => ServiceSize::Medium,
            Some("large") => ServiceSize::Large,
            _ => ServiceSize::Small,
        }
    }

    /// (cpu millicores, memory MiB) limits
    pub fn limits(&self) -> (u32, u32) {
        match self {
            ServiceSize::Small => (250, 256),
            ServiceSize::Medium => (500, 512),
            ServiceSize::Large => (1000, 1024),
        }
    }
}

impl fmt::Display for ServiceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSize::Small => f.write_str("small"),
            ServiceSize::Medium => f.write_str("medium"),
            ServiceSize::Large => f.write_str("large"),
        }
    }
}

/// Desired state of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub namespace: String,
    #[serde(rename = "type")]
    pub typ: ServiceType,
    /// Declaring file
    pub path: String,
    /// Function id for workflow services, empty for service files
    pub name: String,
    pub image: String,
    pub cmd: String,
    pub size: ServiceSize,
    pub scale: u32,
    #[serde(default)]
    pub envs: Vec<EnvVar>,
}

impl ServiceDefinition {
    /// Stable id derived from where the service is declared
    pub fn id(&self) -> String {
        service_id(&self.namespace, &self.name, self.typ, &self.path)
    }

    /// Hash of what the service runs
    pub fn value_hash(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.image.as_bytes());
        h.update(b"|");
        h.update(self.cmd.as_bytes());
        h.update(b"|");
        h.update(self.size.to_string().as_bytes());
        h.update(b"|");
        h.update(self.scale.to_string().as_bytes());
        hex::encode(h.finalize())
    }

    pub fn from_service_file(namespace: &str, path: &str, file: &ServiceFile) -> Self {
        Self {
            namespace: namespace.to_string(),
            typ: ServiceType::Namespace,
            path: path.to_string(),
            name: String::new(),
            image: file.image.clone(),
            cmd: file.cmd.clone().unwrap_or_default(),
            size: ServiceSize::parse(file.size.as_deref()),
            scale: file.scale.unwrap_or(0),
            envs: file.vars.clone(),
        }
    }

    /// Container functions declared inside a workflow
    pub fn from_workflow(namespace: &str, path: &str, workflow: &Workflow) -> Vec<Self> {
        workflow
            .functions
            .iter()
            .filter(|f| f.kind == FunctionKind::Container)
            .filter_map(|f| {
                let image = f.image.clone()?;
                Some(Self {
                    namespace: namespace.to_string(),
                    typ: ServiceType::Workflow,
                    path: path.to_string(),
                    name: f.id.clone(),
                    image,
                    cmd: f.cmd.clone().unwrap_or_default(),
                    size: ServiceSize::parse(f.size.as_deref()),
                    scale: f.scale.unwrap_or(0),
                    envs: f.envs.clone(),
                })
            })
            .collect()
    }
}

/// `obj-` followed by a truncated SHA-256 of the declaration site
pub fn service_id(namespace: &str, name: &str, typ: ServiceType, path: &str) -> String {
    let mut h = Sha256::new();
    for part in [namespace, name, &typ.to_string(), path] {
        h.update(part.as_bytes());
        h.update(b"|");
    }
    let digest = hex::encode(h.finalize());
    format!("obj-{}", &digest[..ID_HASH_LEN])
}

/// Where callers reach a service; computed without asking the runtime
pub fn service_url(backend: FunctionsBackend, knative_namespace: &str, id: &str) -> String {
    match backend {
        FunctionsBackend::Knative => format!("http://{id}.{knative_namespace}.svc.cluster.local"),
        FunctionsBackend::Docker => format!("http://{id}:80"),
        FunctionsBackend::Memory => format!("memory://{id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def() -> ServiceDefinition {
        ServiceDefinition {
            namespace: "ns".into(),
            typ: ServiceType::Namespace,
            path: "/svc.yaml".into(),
            name: String::new(),
            image: "direktiv/echo:v1".into(),
            cmd: String::new(),
            size: ServiceSize::Small,
            scale: 1,
            envs: vec![],
        }
    }

    #[test]
    fn test_id_ignores_content() {
        let a = def();
        let mut b = def();
        b.image = "direktiv/echo:v2".into();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.value_hash(), b.value_hash());
        assert!(a.id().starts_with("obj-"));
        assert_eq!(a.id().len(), 4 + ID_HASH_LEN);
    }

    #[test]
    fn test_id_depends_on_declaration_site() {
        let a = def();
        let mut b = def();
        b.path = "/other.yaml".into();
        assert_ne!(a.id(), b.id());
        b = def();
        b.typ = ServiceType::Workflow;
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_envs_do_not_change_value_hash() {
        let a = def();
        let mut b = def();
        b.envs.push(EnvVar {
            name: "A".into(),
            value: "1".into(),
        });
        assert_eq!(a.value_hash(), b.value_hash());
    }

    #[test]
    fn test_urls() {
        let id = def().id();
        assert_eq!(
            service_url(FunctionsBackend::Knative, "direktiv-services", &id),
            format!("http://{id}.direktiv-services.svc.cluster.local")
        );
        assert_eq!(
            service_url(FunctionsBackend::Docker, "", &id),
            format!("http://{id}:80")
        );
    }

    #[test]
    fn test_from_workflow_takes_container_functions() {
        let wf = Workflow::from_yaml(
            br#"
functions:
- id: echo
  type: container
  image: direktiv/echo
  size: large
- id: child
  type: subflow
  workflow: /child.yaml
states:
- id: a
  type: action
  action:
    function: echo
"#,
        )
        .unwrap();
        let defs = ServiceDefinition::from_workflow("ns", "/wf.yaml", &wf);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[0].size, ServiceSize::Large);
        assert_eq!(defs[0].typ, ServiceType::Workflow);
    }
}

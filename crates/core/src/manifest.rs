// Endpoint, consumer and service file shapes
//
// Decision: Every non-workflow YAML file in the tree declares its shape with `direktiv_api`
// Decision: Plugin configuration stays an untyped JSON map here; the gateway validates it

use serde::{Deserialize, Serialize};

use crate::file::FileKind;
use crate::workflow::EnvVar;

pub const ENDPOINT_API: &str = "endpoint/v2";
pub const CONSUMER_API: &str = "consumer/v2";
pub const SERVICE_API: &str = "service/v1";
pub const WORKFLOW_API: &str = "workflow/v1";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unexpected direktiv_api '{found}', expected '{expected}'")]
    WrongApi { expected: &'static str, found: String },
    #[error("{0}")]
    Invalid(String),
}

/// `type` plus free-form `configuration` of one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub configuration: serde_json::Value,
}

impl PluginConfig {
    pub fn new(typ: impl Into<String>, configuration: serde_json::Value) -> Self {
        Self {
            typ: typ.into(),
            configuration,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub auth: Vec<PluginConfig>,
    #[serde(default)]
    pub inbound: Vec<PluginConfig>,
    #[serde(default)]
    pub target: Option<PluginConfig>,
    #[serde(default)]
    pub outbound: Vec<PluginConfig>,
}

/// Gateway endpoint file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointFile {
    #[serde(default)]
    pub direktiv_api: Option<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// Pipeline budget in seconds; 0 means the gateway default
    #[serde(default)]
    pub timeout: u64,
}

impl EndpointFile {
    pub fn from_yaml(data: &[u8]) -> Result<Self, ManifestError> {
        let ep: EndpointFile = serde_yaml::from_slice(data)?;
        check_api(ep.direktiv_api.as_deref(), ENDPOINT_API)?;
        Ok(ep)
    }
}

/// Gateway consumer file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerFile {
    #[serde(default)]
    pub direktiv_api: Option<String>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl ConsumerFile {
    pub fn from_yaml(data: &[u8]) -> Result<Self, ManifestError> {
        let c: ConsumerFile = serde_yaml::from_slice(data)?;
        check_api(c.direktiv_api.as_deref(), CONSUMER_API)?;
        if c.username.trim().is_empty() {
            return Err(ManifestError::Invalid("consumer username is empty".to_string()));
        }
        Ok(c)
    }
}

/// Namespace service file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceFile {
    #[serde(default)]
    pub direktiv_api: Option<String>,
    pub image: String,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub scale: Option<u32>,
    #[serde(default, alias = "envs")]
    pub vars: Vec<EnvVar>,
}

impl ServiceFile {
    pub fn from_yaml(data: &[u8]) -> Result<Self, ManifestError> {
        let s: ServiceFile = serde_yaml::from_slice(data)?;
        check_api(s.direktiv_api.as_deref(), SERVICE_API)?;
        if s.image.trim().is_empty() {
            return Err(ManifestError::Invalid("service image is empty".to_string()));
        }
        Ok(s)
    }
}

fn check_api(found: Option<&str>, expected: &'static str) -> Result<(), ManifestError> {
    match found {
        None => Ok(()),
        Some(f) if f == expected => Ok(()),
        Some(f) => Err(ManifestError::WrongApi {
            expected,
            found: f.to_string(),
        }),
    }
}

#[derive(Deserialize)]
struct ApiProbe {
    #[serde(default)]
    direktiv_api: Option<String>,
}

/// Infer the file kind of a YAML document from its `direktiv_api` marker
///
/// Documents without a marker are treated as workflows when they carry a
/// `states` list; anything unparsable is a plain file.
pub fn detect_kind(data: &[u8]) -> FileKind {
    let Ok(value) = serde_yaml::from_slice::<serde_yaml::Value>(data) else {
        return FileKind::File;
    };
    let probe: ApiProbe = match serde_yaml::from_value(value.clone()) {
        Ok(p) => p,
        Err(_) => return FileKind::File,
    };
    match probe.direktiv_api.as_deref() {
        Some(ENDPOINT_API) => FileKind::Endpoint,
        Some(CONSUMER_API) => FileKind::Consumer,
        Some(SERVICE_API) => FileKind::Service,
        Some(WORKFLOW_API) => FileKind::Workflow,
        Some(_) => FileKind::File,
        None if value.get("states").is_some() => FileKind::Workflow,
        None => FileKind::File,
    }
}

// Scoped variables
//
// A variable is addressed by (scope, owner, key). The owner is the namespace
// name, the workflow path, or the instance id depending on the scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owner class of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarScope {
    Namespace,
    Workflow,
    Instance,
}

impl std::fmt::Display for VarScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarScope::Namespace => write!(f, "namespace"),
            VarScope::Workflow => write!(f, "workflow"),
            VarScope::Instance => write!(f, "instance"),
        }
    }
}

impl std::str::FromStr for VarScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "namespace" => Ok(VarScope::Namespace),
            "workflow" => Ok(VarScope::Workflow),
            "instance" => Ok(VarScope::Instance),
            other => Err(format!("unknown variable scope: {other}")),
        }
    }
}

/// Fully qualified variable owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarOwner {
    pub namespace: String,
    pub scope: VarScope,
    /// Namespace name, workflow path, or instance id
    pub owner: String,
}

impl VarOwner {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            owner: namespace.clone(),
            namespace,
            scope: VarScope::Namespace,
        }
    }

    pub fn workflow(namespace: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            scope: VarScope::Workflow,
            owner: path.into(),
        }
    }

    pub fn instance(namespace: impl Into<String>, instance_id: Uuid) -> Self {
        Self {
            namespace: namespace.into(),
            scope: VarScope::Instance,
            owner: instance_id.to_string(),
        }
    }
}

/// Variable metadata (everything but the bytes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMeta {
    pub id: Uuid,
    pub namespace: String,
    pub scope: VarScope,
    pub owner: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Hex-encoded SHA-256 of the stored bytes
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Variable with its content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(flatten)]
    pub meta: VariableMeta,
    #[serde(with = "crate::bytes_b64")]
    pub data: Vec<u8>,
}

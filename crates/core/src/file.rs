// File tree nodes
//
// Every namespace has a POSIX-like tree rooted at "/". The root always exists
// and is implicit. Typed files (workflow, endpoint, consumer, service) carry
// YAML that other components compile.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a file tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Directory,
    Workflow,
    Endpoint,
    Consumer,
    Service,
    /// Any other file
    File,
}

impl FileKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, FileKind::Directory)
    }

    /// Default mime type when the client does not provide one
    pub fn default_mime(&self) -> &'static str {
        match self {
            FileKind::Directory => "",
            FileKind::Workflow
            | FileKind::Endpoint
            | FileKind::Consumer
            | FileKind::Service => "application/yaml",
            FileKind::File => "application/octet-stream",
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileKind::Directory => "directory",
            FileKind::Workflow => "workflow",
            FileKind::Endpoint => "endpoint",
            FileKind::Consumer => "consumer",
            FileKind::Service => "service",
            FileKind::File => "file",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directory" => Ok(FileKind::Directory),
            "workflow" => Ok(FileKind::Workflow),
            "endpoint" => Ok(FileKind::Endpoint),
            "consumer" => Ok(FileKind::Consumer),
            "service" => Ok(FileKind::Service),
            "file" => Ok(FileKind::File),
            other => Err(format!("unknown file kind: {other}")),
        }
    }
}

/// A node in a namespace's file tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: Uuid,
    pub namespace: String,
    /// Absolute, normalized path
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Content bytes; empty for directories
    #[serde(with = "crate::bytes_b64", default)]
    pub data: Vec<u8>,
    /// Revision id of the content; a new one on every update
    pub revision: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl File {
    pub fn new(
        namespace: impl Into<String>,
        path: impl Into<String>,
        kind: FileKind,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            namespace: namespace.into(),
            path: path.into(),
            kind,
            mime_type: mime_type.into(),
            data,
            revision: Uuid::now_v7(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The final path segment
    pub fn name(&self) -> &str {
        file_name(&self.path)
    }
}

/// Error for malformed paths
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path cannot be empty")]
    Empty,
    #[error("path cannot contain null characters")]
    NullCharacter,
    #[error("path cannot contain '.' or '..' segments")]
    Traversal,
}

/// Normalize a path: leading "/", no trailing "/", no empty segments
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Normalize and validate a path in one step
pub fn clean_path(path: &str) -> Result<String, PathError> {
    if path.trim().is_empty() {
        return Err(PathError::Empty);
    }
    if path.contains('\0') {
        return Err(PathError::NullCharacter);
    }
    if path.split('/').any(|segment| segment == ".." || segment == ".") {
        return Err(PathError::Traversal);
    }
    Ok(normalize_path(path))
}

/// Parent of a normalized path; `None` for the root
pub fn parent_path(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Last segment of a normalized path
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether `path` lies strictly under directory `dir`
pub fn is_descendant(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path != "/";
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

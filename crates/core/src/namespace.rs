// Namespace entity and the name rule shared with variables and secrets

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pattern for namespace, variable and secret names
pub const NAME_PATTERN: &str = r"^[a-z][a-z0-9\-]{0,}$";

/// Longest accepted name
pub const MAX_NAME_LENGTH: usize = 64;

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(NAME_PATTERN).expect("name pattern is a valid regex"))
}

/// Error returned for names that fail [`NAME_PATTERN`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "invalid name '{name}': must match {pattern} and be at most {max} characters",
    pattern = NAME_PATTERN,
    max = MAX_NAME_LENGTH
)]
pub struct InvalidName {
    pub name: String,
}

/// Validate a namespace / variable / secret name
pub fn validate_name(name: &str) -> Result<(), InvalidName> {
    if name.len() > MAX_NAME_LENGTH || !name_regex().is_match(name) {
        return Err(InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// A namespace owns its file tree, namespace-scoped variables and secrets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: Uuid,
    pub name: String,
    /// Free-form configuration blob
    #[serde(default)]
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            config: serde_json::Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["a", "abc", "my-namespace", "ns1", "a-1-b"] {
            assert!(validate_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "1abc", "-abc", "ABC", "my_ns", "my ns", "ns.1"] {
            assert!(validate_name(name).is_err(), "{name} should be invalid");
        }
    }

    #[test]
    fn test_name_length_cap() {
        let long = format!("a{}", "b".repeat(MAX_NAME_LENGTH));
        assert!(validate_name(&long).is_err());
    }
}

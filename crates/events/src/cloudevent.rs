//! CloudEvents 1.0 (structured JSON mode)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use direktiv_core::workflow::EventFilter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CorrelatorError;

pub const SPEC_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
    /// Extension attributes
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl CloudEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            specversion: SPEC_VERSION.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            subject: None,
            time: Some(Utc::now()),
            datacontenttype: None,
            dataschema: None,
            data: None,
            data_base64: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.datacontenttype = Some("application/json".to_string());
        self.data = Some(data);
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }

    /// Parse and validate a structured-mode event
    pub fn parse(body: &[u8]) -> Result<Self, CorrelatorError> {
        let event: CloudEvent = serde_json::from_slice(body)
            .map_err(|e| CorrelatorError::InvalidEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), CorrelatorError> {
        if self.specversion != SPEC_VERSION {
            return Err(CorrelatorError::InvalidEvent(format!(
                "unsupported specversion '{}'",
                self.specversion
            )));
        }
        for (name, value) in [
            ("id", &self.id),
            ("source", &self.source),
            ("type", &self.event_type),
        ] {
            if value.trim().is_empty() {
                return Err(CorrelatorError::InvalidEvent(format!("missing '{name}'")));
            }
        }
        if self.data.is_some() && self.data_base64.is_some() {
            return Err(CorrelatorError::InvalidEvent(
                "'data' and 'data_base64' are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Context attribute by name, including extensions
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "source" => Some(Value::String(self.source.clone())),
            "type" => Some(Value::String(self.event_type.clone())),
            "specversion" => Some(Value::String(self.specversion.clone())),
            "subject" => self.subject.clone().map(Value::String),
            "datacontenttype" => self.datacontenttype.clone().map(Value::String),
            "dataschema" => self.dataschema.clone().map(Value::String),
            "time" => self.time.map(|t| Value::String(t.to_rfc3339())),
            other => self.extensions.get(other).cloned(),
        }
    }

    /// The event as a JSON document
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Whether `event` satisfies `filter`
pub fn matches(filter: &EventFilter, event: &CloudEvent) -> bool {
    if filter.event_type != event.event_type {
        return false;
    }
    filter.context.iter().all(|(name, expected)| {
        match event.attribute(name) {
            Some(actual) => value_matches(expected, &actual),
            None => false,
        }
    })
}

fn value_matches(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::String(pattern), Value::String(value)) if pattern.contains('*') => {
            glob_regex(pattern).is_some_and(|re| re.is_match(value))
        }
        // Filters written as strings still match numeric or boolean attributes
        (Value::String(pattern), other) if !other.is_string() => *pattern == other.to_string(),
        _ => expected == actual,
    }
}

fn glob_regex(pattern: &str) -> Option<Regex> {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", escaped.join(".*"))).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_with_extensions() {
        let body = json!({
            "specversion": "1.0",
            "id": "1",
            "source": "test",
            "type": "greeting",
            "data": {"name": "x"},
            "region": "eu-west-1"
        });
        let ev = CloudEvent::parse(body.to_string().as_bytes()).unwrap();
        assert_eq!(ev.event_type, "greeting");
        assert_eq!(ev.attribute("region"), Some(json!("eu-west-1")));
        assert_eq!(ev.to_value()["region"], "eu-west-1");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(CloudEvent::parse(b"not json").is_err());
        let no_type = json!({"specversion": "1.0", "id": "1", "source": "s", "type": ""});
        assert!(CloudEvent::parse(no_type.to_string().as_bytes()).is_err());
        let old = json!({"specversion": "0.3", "id": "1", "source": "s", "type": "t"});
        assert!(CloudEvent::parse(old.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_filter_matching() {
        let ev = CloudEvent::new("order.created", "shop")
            .with_extension("region", json!("eu-west-1"))
            .with_extension("priority", json!(3));

        let mut filter = EventFilter::new("order.created");
        assert!(matches(&filter, &ev));

        filter.context.insert("region".into(), json!("eu-*"));
        assert!(matches(&filter, &ev));

        filter.context.insert("priority".into(), json!("3"));
        assert!(matches(&filter, &ev));

        filter.context.insert("region".into(), json!("us-*"));
        assert!(!matches(&filter, &ev));

        let mut missing = EventFilter::new("order.created");
        missing.context.insert("tenant".into(), json!("a"));
        assert!(!matches(&missing, &ev));

        assert!(!matches(&EventFilter::new("order.deleted"), &ev));
    }
}

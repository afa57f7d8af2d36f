use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How instances of a workflow are started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartKind {
    /// Only through the API or gateway
    #[serde(rename = "default")]
    Default,
    /// One matching event starts an instance
    #[serde(rename = "event")]
    Event,
    /// All listed events must arrive
    #[serde(rename = "eventsAnd")]
    EventsAnd,
    /// First of the listed events
    #[serde(rename = "eventsXor")]
    EventsXor,
    /// Cron schedule
    #[serde(rename = "scheduled")]
    Scheduled,
}

impl std::fmt::Display for StartKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StartKind::Default => "default",
            StartKind::Event => "event",
            StartKind::EventsAnd => "eventsAnd",
            StartKind::EventsXor => "eventsXor",
            StartKind::Scheduled => "scheduled",
        };
        f.write_str(s)
    }
}

/// Event predicate: a type plus optional context-attribute filters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Attribute name to expected value; string values may use `*` globs
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl EventFilter {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            context: BTreeMap::new(),
        }
    }
}

/// `start:` block of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDefinition {
    #[serde(rename = "type")]
    pub kind: StartKind,
    /// Overrides the first state as entry point
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub event: Option<EventFilter>,
    #[serde(default)]
    pub events: Vec<EventFilter>,
    #[serde(default)]
    pub cron: Option<String>,
    /// How long a partially matched `eventsAnd` listener keeps its matches
    #[serde(default, with = "crate::duration::iso8601::option")]
    pub lifespan: Option<Duration>,
}

impl StartDefinition {
    /// Predicates this trigger listens for, in declaration order
    pub fn filters(&self) -> Vec<EventFilter> {
        match self.kind {
            StartKind::Event => self.event.iter().cloned().collect(),
            StartKind::EventsAnd | StartKind::EventsXor => self.events.clone(),
            StartKind::Default | StartKind::Scheduled => vec![],
        }
    }
}

// Scheduler cursor
//
// Persisted in InstanceData.cursor at every checkpoint. A cursor with a
// `wait` is suspended; everything needed to resume on another node after a
// crash lives here.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use direktiv_core::WorkflowError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// State being executed
    pub state: String,
    /// Number of state entries so far
    pub step: u32,
    pub document: Value,
    /// Retry attempt of the current state, 0 on first entry
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub wait: Option<Wait>,
    /// Raised by an error state that still transitions; fails the instance at the end
    #[serde(default)]
    pub pending_error: Option<WorkflowError>,
    #[serde(default)]
    pub interrupt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub kill_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interrupted: bool,
    /// Node that last suspended the instance
    #[serde(default)]
    pub owner: Option<String>,
}

impl Cursor {
    pub fn new(state: &str, document: Value) -> Self {
        Self {
            state: state.to_string(),
            document,
            ..Default::default()
        }
    }

    pub fn load(value: &Value) -> Result<Option<Self>, serde_json::Error> {
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value.clone()).map(Some)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Why a suspended instance is waiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Wait {
    /// Delay state or retry back-off
    Timer { until: DateTime<Utc>, retry: bool },
    /// Listener registered with the correlator
    Event {
        listener: Uuid,
        deadline: Option<DateTime<Utc>>,
    },
    /// Function calls in flight
    Actions {
        branches: Vec<Branch>,
        join: Join,
        deadline: Option<DateTime<Utc>>,
    },
}

impl Wait {
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            Wait::Timer { until, .. } => Some(*until),
            Wait::Event { deadline, .. } | Wait::Actions { deadline, .. } => *deadline,
        }
    }
}

/// How branch results combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Join {
    /// One action; its result is `.return`
    Single,
    /// Every branch must succeed; `.return` is the array of results
    All,
    /// First success wins
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub function: String,
    pub input: Value,
    /// Subflow instance, once spawned
    #[serde(default)]
    pub child: Option<Uuid>,
    /// Node running the container call
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
}

impl Branch {
    pub fn new(function: &str, input: Value) -> Self {
        Self {
            function: function.to_string(),
            input,
            child: None,
            node: None,
            outcome: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Ok { value: Value },
    Err { error: WorkflowError },
}

/// Initial document from raw input bytes
///
/// An object is used as is; other JSON is wrapped as `{"input": v}`; anything
/// that is not JSON (including empty input) becomes `{"input": "<base64>"}`.
pub fn initial_document(input: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(input) {
        Ok(v @ Value::Object(_)) => v,
        Ok(other) => json!({ "input": other }),
        Err(_) => json!({ "input": BASE64.encode(input) }),
    }
}

/// Function results that are not JSON are carried as base64 strings
pub fn result_value(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body).unwrap_or_else(|_| Value::String(BASE64.encode(body)))
}

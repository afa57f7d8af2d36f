use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::start::EventFilter;
use crate::variable::VarScope;

/// Fields shared by every state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateCommon {
    pub id: String,
    /// Next state; absent means terminal success
    #[serde(default)]
    pub transition: Option<String>,
    /// JQ transform applied to the document after the state runs
    #[serde(default)]
    pub transform: Option<serde_json::Value>,
    /// Template logged when the state is entered
    #[serde(default)]
    pub log: Option<serde_json::Value>,
    #[serde(default)]
    pub catch: Vec<ErrorCatch>,
}

/// Routes a catchable error to a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCatch {
    /// Glob over error codes (`*` matches any run of characters)
    pub error: String,
    #[serde(default)]
    pub transition: Option<String>,
}

/// A state: common fields plus type-specific ones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    #[serde(flatten)]
    pub common: StateCommon,
    #[serde(flatten)]
    pub kind: StateKind,
}

impl StateDefinition {
    pub fn id(&self) -> &str {
        &self.common.id
    }

    /// Every state id this state can move to
    pub fn transitions(&self) -> Vec<&str> {
        let mut out: Vec<&str> = vec![];
        if let Some(t) = self.common.transition.as_deref() {
            out.push(t);
        }
        out.extend(
            self.common
                .catch
                .iter()
                .filter_map(|c| c.transition.as_deref()),
        );
        match &self.kind {
            StateKind::Switch(s) => {
                out.extend(s.conditions.iter().filter_map(|c| c.transition.as_deref()));
                if let Some(t) = s.default_transition.as_deref() {
                    out.push(t);
                }
            }
            StateKind::EventsXor(s) => {
                out.extend(s.events.iter().filter_map(|e| e.transition.as_deref()));
            }
            _ => {}
        }
        out
    }
}

/// Type-specific part of a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateKind {
    #[serde(rename = "noop")]
    Noop,
    #[serde(rename = "switch")]
    Switch(SwitchState),
    #[serde(rename = "delay")]
    Delay(DelayState),
    #[serde(rename = "action")]
    Action(ActionState),
    #[serde(rename = "getter")]
    Getter(GetterState),
    #[serde(rename = "setter")]
    Setter(SetterState),
    #[serde(rename = "error")]
    Error(ErrorState),
    #[serde(rename = "consumeEvent")]
    ConsumeEvent(ConsumeEventState),
    #[serde(rename = "eventsAnd")]
    EventsAnd(EventsAndState),
    #[serde(rename = "eventsXor")]
    EventsXor(EventsXorState),
    #[serde(rename = "generateEvent")]
    GenerateEvent(GenerateEventState),
    #[serde(rename = "parallel")]
    Parallel(ParallelState),
    #[serde(rename = "foreach")]
    Foreach(ForeachState),
    #[serde(rename = "validate")]
    Validate(ValidateState),
}

impl StateKind {
    pub fn name(&self) -> &'static str {
        match self {
            StateKind::Noop => "noop",
            StateKind::Switch(_) => "switch",
            StateKind::Delay(_) => "delay",
            StateKind::Action(_) => "action",
            StateKind::Getter(_) => "getter",
            StateKind::Setter(_) => "setter",
            StateKind::Error(_) => "error",
            StateKind::ConsumeEvent(_) => "consumeEvent",
            StateKind::EventsAnd(_) => "eventsAnd",
            StateKind::EventsXor(_) => "eventsXor",
            StateKind::GenerateEvent(_) => "generateEvent",
            StateKind::Parallel(_) => "parallel",
            StateKind::Foreach(_) => "foreach",
            StateKind::Validate(_) => "validate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCondition {
    /// JQ predicate; truthy selects this branch
    pub condition: serde_json::Value,
    #[serde(default)]
    pub transition: Option<String>,
    #[serde(default)]
    pub transform: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchState {
    pub conditions: Vec<SwitchCondition>,
    #[serde(default)]
    pub default_transition: Option<String>,
    #[serde(default)]
    pub default_transform: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayState {
    #[serde(with = "crate::duration::iso8601")]
    pub duration: Duration,
}

/// Retry policy of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDefinition {
    pub max_attempts: u32,
    #[serde(default, with = "crate::duration::iso8601")]
    pub delay: Duration,
    #[serde(default)]
    pub multiplier: Option<f64>,
    /// Regular expressions over error codes; empty matches all
    #[serde(default)]
    pub codes: Vec<String>,
}

/// Call of a function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub function: String,
    /// Template producing the function input; defaults to the whole document
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    /// Secrets made available to the function as `.secrets.<name>`
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub retries: Option<RetryDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionState {
    pub action: ActionDefinition,
    /// Fire and forget; the state does not wait for the result
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default, with = "crate::duration::iso8601::option")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetterVariable {
    /// Variable name; may be a template
    pub key: serde_json::Value,
    pub scope: VarScope,
    /// Name under `.var`; defaults to the key
    #[serde(default, rename = "as")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetterState {
    pub variables: Vec<GetterVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetterVariable {
    pub key: serde_json::Value,
    pub scope: VarScope,
    /// Template producing the value
    pub value: serde_json::Value,
    #[serde(default, rename = "mimeType")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetterState {
    pub variables: Vec<SetterVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorState {
    pub error: String,
    /// Template; `%s` markers are filled from `args`
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeEventState {
    pub event: EventFilter,
    #[serde(default, with = "crate::duration::iso8601::option")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsAndState {
    pub events: Vec<EventFilter>,
    #[serde(default, with = "crate::duration::iso8601::option")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XorEvent {
    pub event: EventFilter,
    #[serde(default)]
    pub transition: Option<String>,
    #[serde(default)]
    pub transform: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsXorState {
    pub events: Vec<XorEvent>,
    #[serde(default, with = "crate::duration::iso8601::option")]
    pub timeout: Option<Duration>,
}

/// Event produced by a `generateEvent` state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateEventDefinition {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    /// Template producing the payload
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub datacontenttype: Option<String>,
    /// Extension attributes; values may be templates
    #[serde(default)]
    pub context: std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateEventState {
    pub event: GenerateEventDefinition,
    /// Optional delay before delivery
    #[serde(default, with = "crate::duration::iso8601::option")]
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    /// Wait for every branch
    #[default]
    And,
    /// First successful branch wins
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelState {
    pub actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub mode: ParallelMode,
    #[serde(default, with = "crate::duration::iso8601::option")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeachState {
    /// Expression producing the array to iterate
    pub array: serde_json::Value,
    pub action: ActionDefinition,
    #[serde(default, with = "crate::duration::iso8601::option")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateState {
    /// Expression selecting the value to check; defaults to the whole document
    #[serde(default)]
    pub subject: Option<serde_json::Value>,
    pub schema: serde_json::Value,
}

//! Workflow definitions
//!
//! A workflow file is YAML with a `start` trigger, a list of `functions` and
//! a list of `states`. [`Workflow::from_yaml`] parses and validates in one
//! step, so every `Workflow` value in the system is known to be well formed:
//! exactly one start state, unique ids, and every transition resolves.

mod start;
mod states;
mod validate;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use start::{EventFilter, StartDefinition, StartKind};
pub use states::{
    ActionDefinition, ActionState, ConsumeEventState, DelayState, ErrorCatch, ErrorState, EventsAndState,
    EventsXorState, ForeachState, GenerateEventDefinition, GenerateEventState, GetterState,
    GetterVariable, ParallelMode, ParallelState, RetryDefinition, SetterState, SetterVariable,
    StateCommon, StateDefinition, StateKind, SwitchCondition, SwitchState, ValidateState,
    XorEvent,
};
pub use validate::WorkflowParseError;

/// Default nesting limit for subflows
pub const MAX_SUBFLOW_DEPTH: u32 = 10;

/// Function kinds an action may invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionKind {
    /// Child workflow in the same namespace
    #[serde(rename = "subflow")]
    Subflow,
    /// Container service scoped to this workflow
    #[serde(rename = "container", alias = "knative-workflow")]
    Container,
    /// Container service declared by a namespace service file
    #[serde(rename = "namespace", alias = "knative-namespace")]
    Namespace,
}

/// Name/value pair passed to containers as environment variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// A function an action state may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FunctionKind,
    /// Subflow target path (relative paths resolve against the workflow's directory)
    #[serde(default)]
    pub workflow: Option<String>,
    /// Container image
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub scale: Option<u32>,
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    /// Service file path for namespace functions
    #[serde(default)]
    pub service: Option<String>,
}

/// Instance-wide timeouts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Raises a catchable soft-timeout error
    #[serde(default, with = "crate::duration::iso8601::option")]
    pub interrupt: Option<Duration>,
    /// Cancels the instance
    #[serde(default, with = "crate::duration::iso8601::option")]
    pub kill: Option<Duration>,
}

/// A parsed and validated workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub direktiv_api: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start: Option<StartDefinition>,
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
    pub states: Vec<StateDefinition>,
    #[serde(default)]
    pub timeouts: Option<Timeouts>,
}

impl Workflow {
    /// Parse YAML and validate the result
    pub fn from_yaml(data: &[u8]) -> Result<Self, WorkflowParseError> {
        let workflow: Workflow = serde_yaml::from_slice(data)
            .map_err(|e| WorkflowParseError::Yaml(e.to_string()))?;
        validate::validate(&workflow)?;
        Ok(workflow)
    }

    /// Id of the state execution begins in
    pub fn start_state(&self) -> &str {
        self.start
            .as_ref()
            .and_then(|s| s.state.as_deref())
            .or_else(|| self.states.first().map(|s| s.common.id.as_str()))
            .unwrap_or_default()
    }

    /// Kind of start trigger (`default` when absent)
    pub fn start_kind(&self) -> StartKind {
        self.start
            .as_ref()
            .map(|s| s.kind)
            .unwrap_or(StartKind::Default)
    }

    pub fn state(&self, id: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.common.id == id)
    }

    pub fn function(&self, id: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|f| f.id == id)
    }
}

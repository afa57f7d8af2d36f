//! Instance data
//!
//! An [`InstanceData`] is one execution of a workflow revision. It exclusively
//! owns its flow trail and its instance-scoped variables. Status only moves
//! forward: `pending` to one of the terminal statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkflowError;

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created or running
    Pending,
    /// Finished successfully
    Complete,
    /// Finished with an error
    Failed,
    /// Cancelled through the API, a parent, or a hard timeout
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Pending)
    }

    /// Whether moving from `self` to `next` respects forward-only ordering
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        matches!(self, InstanceStatus::Pending) || *self == next
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// What created the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invoker {
    Api,
    Gateway,
    Event,
    Cron,
    Subflow,
}

impl std::fmt::Display for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Invoker::Api => "api",
            Invoker::Gateway => "gateway",
            Invoker::Event => "event",
            Invoker::Cron => "cron",
            Invoker::Subflow => "subflow",
        };
        f.write_str(s)
    }
}

/// Link from a subflow instance to the parent state waiting on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub instance_id: Uuid,
    pub state_id: String,
    /// Index of the child inside a parallel / foreach state
    pub branch: usize,
    /// Step counter of the parent when the child was spawned
    pub step: u32,
}

/// A single workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceData {
    pub id: Uuid,
    pub namespace: String,
    pub workflow_path: String,
    /// Revision of the workflow file the instance runs
    pub revision: Uuid,
    pub status: InstanceStatus,
    pub invoker: Invoker,
    /// Ordered list of every state entered (including re-entries)
    pub flow: Vec<String>,
    #[serde(with = "crate::bytes_b64")]
    pub input: Vec<u8>,
    #[serde(with = "crate::bytes_b64::option", default)]
    pub output: Option<Vec<u8>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Engine-owned scheduler cursor (current state, step, memory, wake condition)
    #[serde(default)]
    pub cursor: serde_json::Value,
    /// Deadline for the current step; strictly increasing within an instance
    pub deadline: Option<DateTime<Utc>>,
    pub parent: Option<ParentRef>,
    /// Subflow nesting depth (0 for top-level)
    pub depth: u32,
    pub cancel_requested: bool,
    /// Error code the cancellation finishes with
    #[serde(default)]
    pub cancel_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceData {
    pub fn new(
        namespace: impl Into<String>,
        workflow_path: impl Into<String>,
        revision: Uuid,
        invoker: Invoker,
        input: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            namespace: namespace.into(),
            workflow_path: workflow_path.into(),
            revision,
            status: InstanceStatus::Pending,
            invoker,
            flow: vec![],
            input,
            output: None,
            error_code: None,
            error_message: None,
            cursor: serde_json::Value::Null,
            deadline: None,
            parent: None,
            depth: 0,
            cancel_requested: false,
            cancel_code: None,
            created_at: now,
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent: ParentRef, depth: u32) -> Self {
        self.parent = Some(parent);
        self.depth = depth;
        self.invoker = Invoker::Subflow;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Flag the instance for cancellation; the first code wins
    pub fn request_cancel(&mut self, code: &str) {
        if !self.cancel_requested {
            self.cancel_requested = true;
            self.cancel_code = Some(code.to_string());
        }
    }

    /// Typed error, when the instance failed or was cancelled
    pub fn error(&self) -> Option<WorkflowError> {
        self.error_code.as_ref().map(|code| WorkflowError {
            code: code.clone(),
            message: self.error_message.clone().unwrap_or_default(),
            catchable: false,
        })
    }

    /// Append a state id to the flow trail
    ///
    /// Terminal instances are frozen; the call is ignored for them.
    pub fn push_flow(&mut self, state_id: &str) {
        if !self.is_terminal() {
            self.flow.push(state_id.to_string());
        }
    }

    /// Move to a new deadline; earlier values are ignored
    pub fn advance_deadline(&mut self, deadline: DateTime<Utc>) {
        match self.deadline {
            Some(current) if current >= deadline => {}
            _ => self.deadline = Some(deadline),
        }
    }

    /// Finish successfully with the given output document
    pub fn complete(&mut self, output: Vec<u8>) -> bool {
        self.finish(InstanceStatus::Complete, Some(output), None)
    }

    /// Finish with an error; cancellation codes produce `cancelled`
    pub fn fail(&mut self, error: &WorkflowError) -> bool {
        let status = if error.is_cancellation() {
            InstanceStatus::Cancelled
        } else {
            InstanceStatus::Failed
        };
        self.finish(status, None, Some(error))
    }

    fn finish(
        &mut self,
        status: InstanceStatus,
        output: Option<Vec<u8>>,
        error: Option<&WorkflowError>,
    ) -> bool {
        if !self.status.can_transition_to(status) || self.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = status;
        self.output = output;
        if let Some(err) = error {
            self.error_code = Some(err.code.clone());
            self.error_message = Some(err.message.clone());
        }
        self.ended_at = Some(now);
        self.updated_at = now;
        true
    }
}

/// Log line attached to an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceLog {
    pub instance_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub state: Option<String>,
    pub message: String,
}

impl InstanceLog {
    pub fn info(instance_id: Uuid, state: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            instance_id,
            timestamp: Utc::now(),
            level: "info".to_string(),
            state: state.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn error(instance_id: Uuid, state: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            level: "error".to_string(),
            ..Self::info(instance_id, state, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    fn instance() -> InstanceData {
        InstanceData::new("ns", "/wf.yaml", Uuid::now_v7(), Invoker::Api, b"{}".to_vec())
    }

    #[test]
    fn test_status_moves_forward_only() {
        let mut i = instance();
        assert!(i.complete(b"{}".to_vec()));
        assert_eq!(i.status, InstanceStatus::Complete);

        // Terminal is final
        assert!(!i.fail(&WorkflowError::catchable("x", "y")));
        assert_eq!(i.status, InstanceStatus::Complete);
        assert!(i.error_code.is_none());
    }

    #[test]
    fn test_cancellation_maps_to_cancelled() {
        let mut i = instance();
        i.fail(&WorkflowError::uncatchable(codes::CANCELLED_API, "cancelled"));
        assert_eq!(i.status, InstanceStatus::Cancelled);
        assert_eq!(i.error_code.as_deref(), Some(codes::CANCELLED_API));
        assert!(i.ended_at.is_some());
    }

    #[test]
    fn test_flow_frozen_after_terminal() {
        let mut i = instance();
        i.push_flow("a");
        i.push_flow("b");
        i.complete(vec![]);
        i.push_flow("c");
        assert_eq!(i.flow, vec!["a", "b"]);
    }

    #[test]
    fn test_deadline_monotonic() {
        let mut i = instance();
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(5);
        i.advance_deadline(t1);
        i.advance_deadline(t0);
        assert_eq!(i.deadline, Some(t1));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("complete".parse::<InstanceStatus>().unwrap(), InstanceStatus::Complete);
        assert!("running".parse::<InstanceStatus>().is_err());
    }
}

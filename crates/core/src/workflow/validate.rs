use std::collections::HashSet;

use super::{FunctionKind, StartKind, StateKind, Workflow};

/// Error returned when a workflow file is malformed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowParseError {
    #[error("yaml: {0}")]
    Yaml(String),
    #[error("workflow has no states")]
    NoStates,
    #[error("duplicate state id '{0}'")]
    DuplicateState(String),
    #[error("duplicate function id '{0}'")]
    DuplicateFunction(String),
    #[error("start state '{0}' does not exist")]
    UnknownStartState(String),
    #[error("state '{state}' transitions to unknown state '{target}'")]
    UnknownTransition { state: String, target: String },
    #[error("state '{state}' references unknown function '{function}'")]
    UnknownFunction { state: String, function: String },
    #[error("switch state '{0}' has no defaultTransition")]
    MissingDefaultTransition(String),
    #[error("state '{state}': {reason}")]
    InvalidState { state: String, reason: String },
    #[error("function '{function}': {reason}")]
    InvalidFunction { function: String, reason: String },
    #[error("start: {0}")]
    InvalidStart(String),
}

pub(super) fn validate(wf: &Workflow) -> Result<(), WorkflowParseError> {
    if wf.states.is_empty() {
        return Err(WorkflowParseError::NoStates);
    }

    let mut ids = HashSet::new();
    for state in &wf.states {
        if state.common.id.trim().is_empty() {
            return Err(WorkflowParseError::InvalidState {
                state: String::new(),
                reason: "state id cannot be empty".to_string(),
            });
        }
        if !ids.insert(state.common.id.as_str()) {
            return Err(WorkflowParseError::DuplicateState(state.common.id.clone()));
        }
    }

    let mut fn_ids = HashSet::new();
    for f in &wf.functions {
        if !fn_ids.insert(f.id.as_str()) {
            return Err(WorkflowParseError::DuplicateFunction(f.id.clone()));
        }
        validate_function(f)?;
    }

    let start = wf.start_state();
    if !ids.contains(start) {
        return Err(WorkflowParseError::UnknownStartState(start.to_string()));
    }

    validate_start(wf)?;

    for state in &wf.states {
        for target in state.transitions() {
            if !ids.contains(target) {
                return Err(WorkflowParseError::UnknownTransition {
                    state: state.common.id.clone(),
                    target: target.to_string(),
                });
            }
        }

        let functions: Vec<&str> = match &state.kind {
            StateKind::Action(a) => vec![a.action.function.as_str()],
            StateKind::Parallel(p) => p.actions.iter().map(|a| a.function.as_str()).collect(),
            StateKind::Foreach(f) => vec![f.action.function.as_str()],
            _ => vec![],
        };
        for function in functions {
            if !fn_ids.contains(function) {
                return Err(WorkflowParseError::UnknownFunction {
                    state: state.common.id.clone(),
                    function: function.to_string(),
                });
            }
        }

        match &state.kind {
            StateKind::Switch(s) => {
                if s.default_transition.is_none() {
                    return Err(WorkflowParseError::MissingDefaultTransition(
                        state.common.id.clone(),
                    ));
                }
            }
            StateKind::Parallel(p) if p.actions.is_empty() => {
                return Err(invalid_state(&state.common.id, "parallel needs actions"));
            }
            StateKind::EventsAnd(e) if e.events.is_empty() => {
                return Err(invalid_state(&state.common.id, "eventsAnd needs events"));
            }
            StateKind::EventsXor(e) if e.events.is_empty() => {
                return Err(invalid_state(&state.common.id, "eventsXor needs events"));
            }
            StateKind::Getter(g) if g.variables.is_empty() => {
                return Err(invalid_state(&state.common.id, "getter needs variables"));
            }
            StateKind::Setter(s) if s.variables.is_empty() => {
                return Err(invalid_state(&state.common.id, "setter needs variables"));
            }
            StateKind::Error(e) if e.error.trim().is_empty() => {
                return Err(invalid_state(&state.common.id, "error code cannot be empty"));
            }
            StateKind::Action(a) => {
                if let Some(r) = &a.action.retries {
                    if r.max_attempts == 0 {
                        return Err(invalid_state(
                            &state.common.id,
                            "retries.max_attempts must be at least 1",
                        ));
                    }
                    for code in &r.codes {
                        if regex::Regex::new(code).is_err() {
                            return Err(invalid_state(
                                &state.common.id,
                                &format!("invalid retry code pattern '{code}'"),
                            ));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

fn invalid_state(id: &str, reason: &str) -> WorkflowParseError {
    WorkflowParseError::InvalidState {
        state: id.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_function(f: &super::FunctionDefinition) -> Result<(), WorkflowParseError> {
    let invalid = |reason: &str| WorkflowParseError::InvalidFunction {
        function: f.id.clone(),
        reason: reason.to_string(),
    };
    match f.kind {
        FunctionKind::Subflow if f.workflow.as_deref().unwrap_or("").is_empty() => {
            Err(invalid("subflow requires 'workflow'"))
        }
        FunctionKind::Container if f.image.as_deref().unwrap_or("").is_empty() => {
            Err(invalid("container requires 'image'"))
        }
        FunctionKind::Namespace if f.service.as_deref().unwrap_or("").is_empty() => {
            Err(invalid("namespace function requires 'service'"))
        }
        _ => Ok(()),
    }
}

fn validate_start(wf: &Workflow) -> Result<(), WorkflowParseError> {
    let Some(start) = &wf.start else {
        return Ok(());
    };
    match start.kind {
        StartKind::Default => Ok(()),
        StartKind::Event if start.event.is_none() => Err(WorkflowParseError::InvalidStart(
            "event start requires 'event'".to_string(),
        )),
        StartKind::EventsAnd | StartKind::EventsXor if start.events.len() < 2 => Err(
            WorkflowParseError::InvalidStart(format!("{} start requires at least two events", start.kind)),
        ),
        StartKind::Scheduled => {
            let cron = start.cron.as_deref().unwrap_or("");
            cron.parse::<croner::Cron>()
                .map(|_| ())
                .map_err(|e| WorkflowParseError::InvalidStart(format!("invalid cron '{cron}': {e}")))
        }
        _ => Ok(()),
    }
}

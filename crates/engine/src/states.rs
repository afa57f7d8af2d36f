// State implementations
//
// Each function maps a state definition and the current document to a Step.
// Actions launch branches and suspend; `settle` joins their outcomes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use direktiv_core::file::{clean_path, parent_path};
use direktiv_core::workflow::{
    ActionDefinition, ActionState, DelayState, ErrorState, EventFilter, ForeachState,
    FunctionKind, GenerateEventState, GetterState, ParallelMode, ParallelState, SetterState,
    StateDefinition, StateKind, SwitchState, ValidateState,
};
use direktiv_core::{codes, ParentRef, VarOwner, VarScope, WorkflowError};
use direktiv_events::{CloudEvent, ListenerKind, ListenerOwner, ListenerSpec};
use direktiv_storage::StoreError;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cursor::{result_value, Branch, Join, Outcome, Wait};
use crate::engine::{child_error, Delivery};
use crate::invoke::FunctionCall;
use crate::jq;
use crate::run::{Run, Step};

const JSON_MIME: &str = "application/json";

impl Run {
    // ========================================================================
    // Flow control
    // ========================================================================

    pub(crate) fn switch(&self, s: &SwitchState) -> Step {
        for condition in &s.conditions {
            match jq::evaluate(&condition.condition, &self.cursor.document) {
                Ok(v) if jq::truthy(&v) => {
                    return Step::next(condition.transition.clone(), condition.transform.clone())
                }
                Ok(_) => {}
                Err(err) => return Step::Fail(err),
            }
        }
        Step::next(s.default_transition.clone(), s.default_transform.clone())
    }

    pub(crate) fn delay(&self, s: &DelayState) -> Step {
        Step::Suspend(Wait::Timer {
            until: self.deadline_after(s.duration),
            retry: false,
        })
    }

    pub(crate) fn error_state(&mut self, state: &StateDefinition, s: &ErrorState) -> Step {
        let message = match self.error_message(s) {
            Ok(m) => m,
            Err(err) => return Step::Fail(err),
        };
        let err = WorkflowError::catchable(s.error.clone(), message);
        if state.common.transition.is_some() {
            // Remaining states run; the instance still fails at the end
            if self.cursor.pending_error.is_none() {
                self.cursor.pending_error = Some(err);
            }
            return Step::proceed(state);
        }
        Step::Fail(err)
    }

    fn error_message(&self, s: &ErrorState) -> Result<String, WorkflowError> {
        let doc = &self.cursor.document;
        let mut message = match &s.message {
            Some(template) => jq::render_text(template, doc)?,
            None => String::new(),
        };
        for arg in &s.args {
            let value = match jq::evaluate(arg, doc)? {
                Value::String(s) => s,
                other => other.to_string(),
            };
            if !message.contains("%s") {
                break;
            }
            message = message.replacen("%s", &value, 1);
        }
        Ok(message)
    }

    pub(crate) fn validate(&self, state: &StateDefinition, s: &ValidateState) -> Step {
        let subject = match &s.subject {
            Some(expr) => match jq::evaluate(expr, &self.cursor.document) {
                Ok(v) => v,
                Err(err) => return Step::Fail(err),
            },
            None => self.cursor.document.clone(),
        };
        let validator = match jsonschema::validator_for(&s.schema) {
            Ok(v) => v,
            Err(e) => {
                return Step::Fail(WorkflowError::catchable(
                    codes::SCHEMA,
                    format!("invalid schema: {e}"),
                ))
            }
        };
        let problems: Vec<String> = validator
            .iter_errors(&subject)
            .map(|e| e.to_string())
            .collect();
        if !problems.is_empty() {
            return Step::Fail(WorkflowError::catchable(codes::SCHEMA, problems.join("; ")));
        }
        Step::proceed(state)
    }

    // ========================================================================
    // Variables
    // ========================================================================

    fn var_owner(&self, scope: VarScope) -> VarOwner {
        match scope {
            VarScope::Namespace => VarOwner::namespace(&self.inst.namespace),
            VarScope::Workflow => VarOwner::workflow(&self.inst.namespace, &self.inst.workflow_path),
            VarScope::Instance => VarOwner::instance(&self.inst.namespace, self.inst.id),
        }
    }

    pub(crate) async fn getter(&mut self, state: &StateDefinition, s: &GetterState) -> Step {
        let store = self.engine.storage().variables.clone();
        let mut values = Map::new();
        for var in &s.variables {
            let key = match jq::render_text(&var.key, &self.cursor.document) {
                Ok(k) => k,
                Err(err) => return Step::Fail(err),
            };
            let value = match store.get_variable(&self.var_owner(var.scope), &key).await {
                Ok(variable) => decode_variable(&variable.meta.mime_type, &variable.data),
                Err(StoreError::NotFound(_)) => Value::Null,
                Err(e) => return Step::Fail(variable_error(&key, e)),
            };
            values.insert(var.alias.clone().unwrap_or(key), value);
        }

        if let Value::Object(doc) = &mut self.cursor.document {
            let slot = doc
                .entry("var")
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(vars) = slot {
                vars.extend(values);
            }
        }
        Step::proceed(state)
    }

    pub(crate) async fn setter(&mut self, state: &StateDefinition, s: &SetterState) -> Step {
        let storage = self.engine.storage().clone();
        for var in &s.variables {
            let doc = &self.cursor.document;
            let key = match jq::render_text(&var.key, doc) {
                Ok(k) => k,
                Err(err) => return Step::Fail(err),
            };
            let value = match jq::render(&var.value, doc) {
                Ok(v) => v,
                Err(err) => return Step::Fail(err),
            };
            let owner = self.var_owner(var.scope);

            if value.is_null() {
                match storage.variables.get_variable(&owner, &key).await {
                    Ok(existing) => {
                        if let Err(e) = storage
                            .variables
                            .delete_variable(&owner.namespace, existing.meta.id)
                            .await
                        {
                            return Step::Fail(variable_error(&key, e));
                        }
                    }
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Step::Fail(variable_error(&key, e)),
                }
                continue;
            }

            let mime = var.mime_type.as_deref().unwrap_or(JSON_MIME);
            let data = encode_variable(mime, &value);
            if let Err(e) = storage.limit.check(data.len() as u64) {
                return Step::Fail(variable_error(&key, e));
            }
            if let Err(e) = storage.variables.set_variable(&owner, &key, mime, data).await {
                return Step::Fail(variable_error(&key, e));
            }
        }
        Step::proceed(state)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register the state's listener and suspend on it
    pub(crate) fn listen(&mut self, state: &StateDefinition, deadline: Option<Option<DateTime<Utc>>>) -> Step {
        let (kind, filters, timeout) = match &state.kind {
            StateKind::ConsumeEvent(s) => (ListenerKind::Single, vec![s.event.clone()], s.timeout),
            StateKind::EventsAnd(s) => (ListenerKind::And, s.events.clone(), s.timeout),
            StateKind::EventsXor(s) => (
                ListenerKind::Xor,
                s.events.iter().map(|x| x.event.clone()).collect(),
                s.timeout,
            ),
            _ => {
                return Step::Fail(WorkflowError::internal(format!(
                    "state '{}' does not consume events",
                    state.id()
                )))
            }
        };
        let filters = match self.render_filters(filters) {
            Ok(f) => f,
            Err(err) => return Step::Fail(err),
        };
        let deadline = deadline.unwrap_or_else(|| timeout.map(|t| self.deadline_after(t)));

        let owner = ListenerOwner::Instance {
            instance_id: self.inst.id,
            state: state.id().to_string(),
        };
        let mut spec = ListenerSpec::new(&self.inst.namespace, owner, kind, filters);
        if let Some(at) = deadline {
            spec = spec.with_deadline(at);
        }
        match self.engine.correlator().register(spec) {
            Ok(listener) => Step::Suspend(Wait::Event { listener, deadline }),
            Err(e) => Step::Fail(WorkflowError::internal(format!("listener registration failed: {e}"))),
        }
    }

    /// Context values may be templates over the document
    fn render_filters(&self, filters: Vec<EventFilter>) -> Result<Vec<EventFilter>, WorkflowError> {
        filters
            .into_iter()
            .map(|mut f| {
                for value in f.context.values_mut() {
                    *value = jq::render(value, &self.cursor.document)?;
                }
                Ok(f)
            })
            .collect()
    }

    pub(crate) fn resume_events(
        &mut self,
        state: &StateDefinition,
        listener: uuid::Uuid,
        deadline: Option<DateTime<Utc>>,
    ) -> Step {
        let fired = self.take_delivery(|d| match d {
            Delivery::Events {
                listener: l,
                events,
                matched,
            } if *l == listener => Some((events.clone(), *matched)),
            _ => None,
        });
        if let Some((events, matched)) = fired {
            if let Value::Object(doc) = &mut self.cursor.document {
                for event in &events {
                    doc.insert(event.event_type.clone(), event.to_value());
                }
            }
            if let (StateKind::EventsXor(s), Some(i)) = (&state.kind, matched) {
                if let Some(branch) = s.events.get(i) {
                    return Step::next(
                        branch.transition.clone().or_else(|| state.common.transition.clone()),
                        branch.transform.clone(),
                    );
                }
            }
            return Step::proceed(state);
        }

        let expired = self
            .take_delivery(|d| match d {
                Delivery::EventTimeout { listener: l } if *l == listener => Some(()),
                _ => None,
            })
            .is_some();
        let overdue = deadline.is_some_and(|at| self.engine.now() >= at);
        if expired || overdue {
            let _ = self.engine.correlator().cancel(listener);
            return Step::Fail(WorkflowError::catchable(
                codes::EVENT_TIMEOUT,
                format!("state '{}' timed out waiting for events", state.id()),
            ));
        }

        if self.recovering
            && !self
                .engine
                .correlator()
                .listeners(&self.inst.namespace)
                .iter()
                .any(|l| l.id == listener)
        {
            debug!(instance = %self.inst.id, "re-registering lost listener");
            return self.listen(state, Some(deadline));
        }
        Step::Suspend(Wait::Event { listener, deadline })
    }

    pub(crate) async fn generate_event(
        &mut self,
        state: &StateDefinition,
        s: &GenerateEventState,
    ) -> Step {
        let doc = &self.cursor.document;
        let mut event = CloudEvent::new(s.event.event_type.clone(), s.event.source.clone());
        if let Some(data) = &s.event.data {
            match jq::render(data, doc) {
                Ok(v) => event = event.with_data(v),
                Err(err) => return Step::Fail(err),
            }
        }
        if let Some(ct) = &s.event.datacontenttype {
            event.datacontenttype = Some(ct.clone());
        }
        for (name, template) in &s.event.context {
            match jq::render(template, doc) {
                Ok(v) => event = event.with_extension(name.clone(), v),
                Err(err) => return Step::Fail(err),
            }
        }

        let namespace = self.inst.namespace.clone();
        match s.delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = engine.broadcast(&namespace, event).await {
                        warn!(namespace = %namespace, error = %e, "delayed event not delivered");
                    }
                });
            }
            None => {
                if let Err(e) = self.engine.broadcast(&namespace, event).await {
                    return Step::Fail(WorkflowError::internal(format!("event broadcast failed: {e}")));
                }
            }
        }
        Step::proceed(state)
    }

    // ========================================================================
    // Actions
    // ========================================================================

    pub(crate) async fn action(&mut self, state: &StateDefinition, s: &ActionState) -> Step {
        let input = match self.action_input(&s.action, &self.cursor.document.clone()).await {
            Ok(v) => v,
            Err(err) => return Step::Fail(err),
        };
        let mut branch = Branch::new(&s.action.function, input);

        if s.is_async {
            if let Err(err) = self.launch(state, &mut branch, 0, true).await {
                return Step::Fail(err);
            }
            return Step::proceed(state);
        }
        self.start_branches(state, vec![branch], Join::Single, s.timeout).await
    }

    pub(crate) async fn parallel(&mut self, state: &StateDefinition, s: &ParallelState) -> Step {
        let doc = self.cursor.document.clone();
        let mut branches = Vec::with_capacity(s.actions.len());
        for action in &s.actions {
            match self.action_input(action, &doc).await {
                Ok(input) => branches.push(Branch::new(&action.function, input)),
                Err(err) => return Step::Fail(err),
            }
        }
        let join = match s.mode {
            ParallelMode::And => Join::All,
            ParallelMode::Or => Join::Any,
        };
        self.start_branches(state, branches, join, s.timeout).await
    }

    pub(crate) async fn foreach(&mut self, state: &StateDefinition, s: &ForeachState) -> Step {
        let items = match jq::evaluate(&s.array, &self.cursor.document) {
            Ok(Value::Array(items)) => items,
            Ok(other) => {
                return Step::Fail(WorkflowError::catchable(
                    codes::JQ,
                    format!("foreach expects an array, got {other}"),
                ))
            }
            Err(err) => return Step::Fail(err),
        };
        let mut branches = Vec::with_capacity(items.len());
        for item in &items {
            match self.action_input(&s.action, item).await {
                Ok(input) => branches.push(Branch::new(&s.action.function, input)),
                Err(err) => return Step::Fail(err),
            }
        }
        self.start_branches(state, branches, Join::All, s.timeout).await
    }

    /// Action input evaluated against `scope`, with requested secrets added
    async fn action_input(
        &self,
        action: &ActionDefinition,
        scope: &Value,
    ) -> Result<Value, WorkflowError> {
        let mut input = match &action.input {
            Some(expr) => jq::evaluate(expr, scope)?,
            None => scope.clone(),
        };
        if action.secrets.is_empty() {
            return Ok(input);
        }

        let mut secrets = Map::new();
        for name in &action.secrets {
            let value = self
                .engine
                .storage()
                .secrets
                .get_secret(&self.inst.namespace, name)
                .await
                .map_err(|e| match e {
                    StoreError::NotFound(_) => WorkflowError::catchable(
                        codes::SECRET_MISSING,
                        format!("secret '{name}' does not exist"),
                    ),
                    other => WorkflowError::internal(format!("secret '{name}': {other}")),
                })?;
            secrets.insert(
                name.clone(),
                Value::String(String::from_utf8_lossy(&value).into_owned()),
            );
        }
        if !input.is_object() {
            let mut wrapped = Map::new();
            wrapped.insert("input".to_string(), input);
            input = Value::Object(wrapped);
        }
        if let Value::Object(map) = &mut input {
            map.insert("secrets".to_string(), Value::Object(secrets));
        }
        Ok(input)
    }

    async fn start_branches(
        &mut self,
        state: &StateDefinition,
        mut branches: Vec<Branch>,
        join: Join,
        timeout: Option<Duration>,
    ) -> Step {
        if branches.is_empty() {
            self.set_field("return", Value::Array(vec![]));
            return Step::proceed(state);
        }
        let deadline =
            Some(self.deadline_after(timeout.unwrap_or(self.engine.config().action_timeout)));
        for index in 0..branches.len() {
            if let Err(err) = self.launch(state, &mut branches[index], index, false).await {
                self.cancel_children(&branches).await;
                return Step::Fail(err);
            }
        }
        Step::Suspend(Wait::Actions {
            branches,
            join,
            deadline,
        })
    }

    /// Start one branch; `detached` calls report to nobody
    async fn launch(
        &mut self,
        state: &StateDefinition,
        branch: &mut Branch,
        index: usize,
        detached: bool,
    ) -> Result<(), WorkflowError> {
        let function = self.wf.function(&branch.function).cloned().ok_or_else(|| {
            WorkflowError::catchable(
                codes::ACTION_FAILED,
                format!("function '{}' is not defined", branch.function),
            )
        })?;
        let step = self.cursor.step;

        match function.kind {
            FunctionKind::Subflow => {
                let target = function.workflow.as_deref().unwrap_or_default();
                let path = self.resolve_path(target)?;
                let input = serde_json::to_vec(&branch.input)
                    .map_err(|e| WorkflowError::internal(e.to_string()))?;
                let link = (!detached).then(|| ParentRef {
                    instance_id: self.inst.id,
                    state_id: state.id().to_string(),
                    branch: index,
                    step,
                });
                let child = self
                    .engine
                    .create_child(&self.inst, &path, input, link)
                    .await?;
                branch.child = Some(child.id);
            }
            FunctionKind::Container | FunctionKind::Namespace => {
                let call = FunctionCall {
                    namespace: self.inst.namespace.clone(),
                    workflow_path: self.inst.workflow_path.clone(),
                    instance_id: self.inst.id,
                    action_id: format!("{}-{}-{}", self.inst.id, step, index),
                    function,
                    input: branch.input.clone(),
                    deadline: self.deadline_after(self.engine.config().action_timeout),
                };
                branch.node = Some(self.engine.config().node.clone());
                let reply = (!detached).then_some((step, index));
                self.engine.spawn_call(call, reply);
            }
        }
        Ok(())
    }

    /// Subflow paths are relative to the calling workflow's directory
    fn resolve_path(&self, target: &str) -> Result<String, WorkflowError> {
        let joined = if target.starts_with('/') {
            target.to_string()
        } else {
            let dir = parent_path(&self.inst.workflow_path).unwrap_or_else(|| "/".to_string());
            format!("{dir}/{target}")
        };
        clean_path(&joined).map_err(|e| {
            WorkflowError::catchable(codes::ACTION_FAILED, format!("subflow '{target}': {e}"))
        })
    }

    /// Fold arrived outcomes into the branches and join them
    pub(crate) async fn settle(
        &mut self,
        state: &StateDefinition,
        mut branches: Vec<Branch>,
        join: Join,
        deadline: Option<DateTime<Utc>>,
    ) -> Step {
        let step = self.cursor.step;
        while let Some((index, outcome)) = self.take_delivery(|d| match d {
            Delivery::Branch {
                step: s,
                index,
                outcome,
            } if *s == step => Some((*index, outcome.clone())),
            _ => None,
        }) {
            if let Some(branch) = branches.get_mut(index) {
                branch.outcome.get_or_insert(outcome);
            }
        }

        // Children finishing on another node only leave a stored result
        for branch in branches.iter_mut().filter(|b| b.outcome.is_none()) {
            let Some(child) = branch.child else { continue };
            match self.engine.get(child).await {
                Ok(inst) if inst.is_terminal() => {
                    branch.outcome = Some(match inst.error() {
                        Some(err) => Outcome::Err {
                            error: child_error(err),
                        },
                        None => Outcome::Ok {
                            value: result_value(inst.output.as_deref().unwrap_or_default()),
                        },
                    });
                }
                Ok(_) => {}
                Err(e) => debug!(child = %child, error = %e, "child lookup failed"),
            }
        }

        if self.recovering {
            self.relaunch_lost_calls(state, &mut branches).await;
        }

        let done = match join {
            Join::Single | Join::All => {
                if let Some(error) = branches.iter().find_map(|b| match &b.outcome {
                    Some(Outcome::Err { error }) => Some(error.clone()),
                    _ => None,
                }) {
                    Some(Err(error))
                } else if branches.iter().all(|b| b.outcome.is_some()) {
                    let mut values = branches.iter().filter_map(|b| match &b.outcome {
                        Some(Outcome::Ok { value }) => Some(value.clone()),
                        _ => None,
                    });
                    Some(Ok(if join == Join::Single {
                        values.next().unwrap_or(Value::Null)
                    } else {
                        Value::Array(values.collect())
                    }))
                } else {
                    None
                }
            }
            Join::Any => {
                if let Some(value) = branches.iter().find_map(|b| match &b.outcome {
                    Some(Outcome::Ok { value }) => Some(value.clone()),
                    _ => None,
                }) {
                    Some(Ok(value))
                } else if branches.iter().all(|b| b.outcome.is_some()) {
                    branches.iter().rev().find_map(|b| match &b.outcome {
                        Some(Outcome::Err { error }) => Some(Err(error.clone())),
                        _ => None,
                    })
                } else {
                    None
                }
            }
        };

        match done {
            Some(Ok(value)) => {
                self.cancel_children(&branches).await;
                self.set_field("return", value);
                Step::proceed(state)
            }
            Some(Err(error)) => {
                self.cancel_children(&branches).await;
                Step::Fail(error)
            }
            None if deadline.is_some_and(|at| self.engine.now() >= at) => {
                self.cancel_children(&branches).await;
                Step::Fail(WorkflowError::catchable(
                    codes::ACTION_TIMEOUT,
                    format!("state '{}' timed out waiting for actions", state.id()),
                ))
            }
            None => Step::Suspend(Wait::Actions {
                branches,
                join,
                deadline,
            }),
        }
    }

    /// Re-issue container calls this node started before a restart
    async fn relaunch_lost_calls(&mut self, state: &StateDefinition, branches: &mut [Branch]) {
        let node = self.engine.config().node.clone();
        let step = self.cursor.step;
        for index in 0..branches.len() {
            let branch = &branches[index];
            let ours = branch.node.as_deref() == Some(node.as_str());
            let action_id = format!("{}-{}-{}", self.inst.id, step, index);
            if branch.outcome.is_some()
                || branch.child.is_some()
                || !ours
                || self.engine.inner.inflight.contains(&action_id)
            {
                continue;
            }
            debug!(instance = %self.inst.id, index, "re-issuing container call");
            if let Err(error) = self.launch(state, &mut branches[index], index, false).await {
                branches[index].outcome = Some(Outcome::Err { error });
            }
        }
    }

    pub(crate) async fn cancel_children(&self, branches: &[Branch]) {
        for branch in branches.iter().filter(|b| b.outcome.is_none()) {
            if let Some(child) = branch.child {
                if let Err(e) = self.engine.cancel_with(child, codes::CANCELLED_PARENT).await {
                    debug!(child = %child, error = %e, "child cancellation skipped");
                }
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn deadline_after(&self, duration: Duration) -> DateTime<Utc> {
        self.engine.now() + ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero())
    }

    fn set_field(&mut self, key: &str, value: Value) {
        if let Value::Object(doc) = &mut self.cursor.document {
            doc.insert(key.to_string(), value);
        }
    }
}

fn variable_error(key: &str, err: StoreError) -> WorkflowError {
    WorkflowError::catchable(codes::VARIABLE, format!("variable '{key}': {err}"))
}

/// JSON is parsed, text stays a string, anything else is carried as base64
fn decode_variable(mime: &str, data: &[u8]) -> Value {
    if let Ok(v) = serde_json::from_slice::<Value>(data) {
        if mime.starts_with(JSON_MIME) || !mime.starts_with("text/") {
            return v;
        }
    }
    match std::str::from_utf8(data) {
        Ok(s) if mime.starts_with("text/") => Value::String(s.to_string()),
        _ => Value::String(BASE64.encode(data)),
    }
}

/// Strings under a non-JSON mime type are stored raw; base64 input is decoded
/// for binary types
fn encode_variable(mime: &str, value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) if !mime.starts_with(JSON_MIME) => {
            if mime.starts_with("text/") {
                s.as_bytes().to_vec()
            } else {
                BASE64.decode(s).unwrap_or_else(|_| s.as_bytes().to_vec())
            }
        }
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variable_encoding() {
        assert_eq!(encode_variable("application/json", &json!({"a": 1})), br#"{"a":1}"#);
        assert_eq!(encode_variable("text/plain", &json!("hi")), b"hi");
        assert_eq!(encode_variable("application/octet-stream", &json!("aGk=")), b"hi");

        assert_eq!(decode_variable("application/json", br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(decode_variable("text/plain", b"42"), json!("42"));
        assert_eq!(decode_variable("application/octet-stream", &[0xff, 0x00]), json!("/wA="));
    }
}

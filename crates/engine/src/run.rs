// State machine driver
//
// One `Run` owns an instance for the duration of a leased advance. The loop
// takes explicit tokens from each state (next, suspend, fail) and never keeps
// a continuation outside the persisted cursor.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use direktiv_core::workflow::{RetryDefinition, StateDefinition, StateKind};
use direktiv_core::{codes, InstanceData, Workflow, WorkflowError};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::cursor::{initial_document, Cursor, Wait};
use crate::engine::{Delivery, Engine};
use crate::error::EngineError;
use crate::jq;
use crate::scheduler::TimerKind;

/// What a state asks the driver to do next
pub(crate) enum Step {
    /// Leave the state; `transform` replaces the state's own transform
    Next {
        transition: Option<String>,
        transform: Option<Value>,
    },
    Suspend(Wait),
    Fail(WorkflowError),
}

impl Step {
    pub fn next(transition: Option<String>, transform: Option<Value>) -> Self {
        Step::Next {
            transition,
            transform,
        }
    }

    /// Leave through the state's common transition
    pub fn proceed(state: &StateDefinition) -> Self {
        Step::next(state.common.transition.clone(), None)
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Boundary {
    /// Ends the instance immediately
    Stop(WorkflowError),
    /// Raised in the current state as a catchable error
    Raise(WorkflowError),
}

pub(crate) struct Run {
    pub engine: Engine,
    pub inst: InstanceData,
    pub wf: Arc<Workflow>,
    pub cursor: Cursor,
    pub deliveries: Vec<Delivery>,
    /// Adopted after a restart; lost listeners and calls are re-issued
    pub recovering: bool,
}

impl Engine {
    /// Advance one instance as far as it goes without blocking
    #[instrument(skip(self))]
    pub(crate) async fn advance(&self, id: Uuid) -> Result<(), EngineError> {
        let mut inst = match self.get(id).await {
            Ok(inst) => inst,
            Err(EngineError::InstanceNotFound(_)) => {
                self.forget(id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let deliveries = self.take_deliveries(id);
        let recovering = self.inner.recovering.remove(&id).is_some();
        if inst.is_terminal() {
            self.forget(id);
            return Ok(());
        }

        let wf = match self.workflow(&inst).await {
            Ok(wf) => wf,
            Err(err) => return self.finalize(&mut inst, Err(err)).await,
        };
        let (cursor, fresh) = match Cursor::load(&inst.cursor) {
            Ok(Some(cursor)) => (cursor, false),
            Ok(None) => (
                Cursor::new(wf.start_state(), initial_document(&inst.input)),
                true,
            ),
            Err(e) => {
                let err = WorkflowError::internal(format!("malformed scheduler cursor: {e}"));
                return self.finalize(&mut inst, Err(err)).await;
            }
        };

        let mut run = Run {
            engine: self.clone(),
            inst,
            wf,
            cursor,
            deliveries,
            recovering,
        };
        if fresh {
            run.begin().await?;
        } else if recovering {
            run.rearm_timeouts();
        }
        run.drive().await
    }
}

impl Run {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.engine.now()
    }

    pub fn state_id(&self) -> String {
        self.cursor.state.clone()
    }

    /// First advance: instance timeouts and the start state's flow entry
    async fn begin(&mut self) -> Result<(), EngineError> {
        let now = self.now();
        if let Some(timeouts) = &self.wf.timeouts {
            self.cursor.interrupt_at = timeouts
                .interrupt
                .and_then(|d| ChronoDuration::from_std(d).ok())
                .map(|d| now + d);
            self.cursor.kill_at = timeouts
                .kill
                .and_then(|d| ChronoDuration::from_std(d).ok())
                .map(|d| now + d);
        }
        self.rearm_timeouts();
        let start = self.cursor.state.clone();
        self.inst.push_flow(&start);
        self.checkpoint().await
    }

    fn rearm_timeouts(&self) {
        let scheduler = &self.engine.inner.scheduler;
        if let Some(at) = self.cursor.interrupt_at.filter(|_| !self.cursor.interrupted) {
            scheduler.arm(self.inst.id, TimerKind::Interrupt, at);
        }
        if let Some(at) = self.cursor.kill_at {
            scheduler.arm(self.inst.id, TimerKind::Kill, at);
        }
    }

    async fn drive(&mut self) -> Result<(), EngineError> {
        loop {
            let Some(state) = self.wf.state(&self.cursor.state).cloned() else {
                let err = WorkflowError::internal(format!("unknown state '{}'", self.cursor.state));
                return self.finish(Err(err)).await;
            };

            match self.boundary() {
                Some(Boundary::Stop(err)) => return self.finish(Err(err)).await,
                Some(Boundary::Raise(err)) => {
                    if let Some(wait) = self.cursor.wait.take() {
                        self.abandon(wait).await;
                    }
                    match self.handle_error(&state, err).await? {
                        Flow::Continue => continue,
                        Flow::Stop => return Ok(()),
                    }
                }
                None => {}
            }

            let step = match self.cursor.wait.take() {
                Some(wait) => self.resume(&state, wait).await,
                None => self.enter(&state).await,
            };

            match step {
                Step::Next {
                    transition,
                    transform,
                } => {
                    if let Err(err) = self.apply_transform(&state, transform) {
                        match self.handle_error(&state, err).await? {
                            Flow::Continue => continue,
                            Flow::Stop => return Ok(()),
                        }
                    }
                    match transition {
                        Some(next) => self.goto(&next).await?,
                        None => return self.complete().await,
                    }
                }
                Step::Suspend(wait) => return self.suspend(wait).await,
                Step::Fail(err) => match self.handle_error(&state, err).await? {
                    Flow::Continue => continue,
                    Flow::Stop => return Ok(()),
                },
            }
        }
    }

    /// Cancellation and instance timeouts, checked at every state boundary
    fn boundary(&mut self) -> Option<Boundary> {
        let code = self.engine.local_cancel(self.inst.id).or_else(|| {
            self.inst.cancel_requested.then(|| {
                self.inst
                    .cancel_code
                    .clone()
                    .unwrap_or_else(|| codes::CANCELLED_API.to_string())
            })
        });
        if let Some(code) = code {
            let message = if code == codes::CANCELLED_PARENT {
                "cancelled by parent instance"
            } else {
                "cancelled by api request"
            };
            return Some(Boundary::Stop(WorkflowError::uncatchable(code, message)));
        }

        let now = self.now();
        if self.cursor.kill_at.is_some_and(|at| now >= at) {
            return Some(Boundary::Stop(WorkflowError::uncatchable(
                codes::TIMEOUT_HARD,
                "instance exceeded its kill timeout",
            )));
        }
        if !self.cursor.interrupted && self.cursor.interrupt_at.is_some_and(|at| now >= at) {
            self.cursor.interrupted = true;
            return Some(Boundary::Raise(WorkflowError::catchable(
                codes::TIMEOUT_SOFT,
                "instance exceeded its interrupt timeout",
            )));
        }
        None
    }

    /// Enter a state; logs its `log` template first
    pub(crate) async fn enter(&mut self, state: &StateDefinition) -> Step {
        self.cursor.step += 1;
        let deadline = self.now()
            + ChronoDuration::from_std(self.engine.config().action_timeout)
                .unwrap_or_else(|_| ChronoDuration::minutes(15));
        self.inst.advance_deadline(deadline);

        if let Some(template) = &state.common.log {
            match jq::render_text(template, &self.cursor.document) {
                Ok(message) => {
                    self.engine
                        .log(&self.inst, Some(state.id()), message)
                        .await
                }
                Err(err) => return Step::Fail(err),
            }
        }

        match &state.kind {
            StateKind::Noop => Step::proceed(state),
            StateKind::Switch(s) => self.switch(s),
            StateKind::Delay(s) => self.delay(s),
            StateKind::Getter(s) => self.getter(state, s).await,
            StateKind::Setter(s) => self.setter(state, s).await,
            StateKind::Error(s) => self.error_state(state, s),
            StateKind::ConsumeEvent(_) | StateKind::EventsAnd(_) | StateKind::EventsXor(_) => {
                self.listen(state, None)
            }
            StateKind::GenerateEvent(s) => self.generate_event(state, s).await,
            StateKind::Action(s) => self.action(state, s).await,
            StateKind::Parallel(s) => self.parallel(state, s).await,
            StateKind::Foreach(s) => self.foreach(state, s).await,
            StateKind::Validate(s) => self.validate(state, s),
        }
    }

    async fn resume(&mut self, state: &StateDefinition, wait: Wait) -> Step {
        match wait {
            Wait::Timer { until, retry } => {
                if self.now() < until {
                    Step::Suspend(Wait::Timer { until, retry })
                } else if retry {
                    self.cursor.attempt += 1;
                    self.inst.push_flow(state.id());
                    self.enter(state).await
                } else {
                    Step::proceed(state)
                }
            }
            Wait::Event { listener, deadline } => {
                self.resume_events(state, listener, deadline)
            }
            Wait::Actions {
                branches,
                join,
                deadline,
            } => self.settle(state, branches, join, deadline).await,
        }
    }

    fn apply_transform(
        &mut self,
        state: &StateDefinition,
        transform: Option<Value>,
    ) -> Result<(), WorkflowError> {
        if let Some(expr) = transform.as_ref().or(state.common.transform.as_ref()) {
            self.cursor.document = jq::transform(expr, &self.cursor.document)?;
        }
        Ok(())
    }

    async fn goto(&mut self, next: &str) -> Result<(), EngineError> {
        self.cursor.state = next.to_string();
        self.cursor.attempt = 0;
        self.inst.push_flow(next);
        self.checkpoint().await?;
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Route an error: retry policy, then the first matching catch, else fail
    async fn handle_error(
        &mut self,
        state: &StateDefinition,
        err: WorkflowError,
    ) -> Result<Flow, EngineError> {
        self.engine
            .log_error(&self.inst, Some(state.id()), format!("{err}"))
            .await;

        if !err.catchable {
            self.finish(Err(err)).await?;
            return Ok(Flow::Stop);
        }

        if let Some(retry) = retry_policy(state) {
            if err.code != codes::TIMEOUT_SOFT
                && self.cursor.attempt < retry.max_attempts
                && retry_matches(retry, &err.code)
            {
                let delay = backoff(retry, self.cursor.attempt);
                let until = self.now()
                    + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
                debug!(
                    instance = %self.inst.id,
                    attempt = self.cursor.attempt + 1,
                    "retrying state"
                );
                self.suspend(Wait::Timer { until, retry: true }).await?;
                return Ok(Flow::Stop);
            }
        }

        let catch = state
            .common
            .catch
            .iter()
            .find(|c| glob_match(&c.error, &err.code))
            .cloned();
        let Some(catch) = catch else {
            self.finish(Err(err)).await?;
            return Ok(Flow::Stop);
        };

        if let Value::Object(map) = &mut self.cursor.document {
            map.insert(
                "error".to_string(),
                json!({ "code": err.code, "msg": err.message }),
            );
        }
        match catch.transition {
            Some(next) => {
                self.goto(&next).await?;
                Ok(Flow::Continue)
            }
            None => {
                self.complete().await?;
                Ok(Flow::Stop)
            }
        }
    }

    /// Release whatever a wait holds when the state is left early
    async fn abandon(&mut self, wait: Wait) {
        match wait {
            Wait::Timer { .. } => {}
            Wait::Event { listener, .. } => {
                let _ = self.engine.inner.correlator.cancel(listener);
            }
            Wait::Actions { branches, .. } => self.cancel_children(&branches).await,
        }
    }

    async fn suspend(&mut self, wait: Wait) -> Result<(), EngineError> {
        let scheduler = &self.engine.inner.scheduler;
        match wait.deadline() {
            Some(at) => {
                scheduler.arm(self.inst.id, TimerKind::Wake, at);
                self.inst.advance_deadline(at);
            }
            None => scheduler.disarm(self.inst.id, TimerKind::Wake),
        }
        self.cursor.owner = Some(self.engine.config().node.clone());
        self.cursor.wait = Some(wait);
        self.checkpoint().await
    }

    async fn checkpoint(&mut self) -> Result<(), EngineError> {
        self.inst.cursor = self.cursor.to_value();
        self.inst.updated_at = chrono::Utc::now();
        self.engine
            .inner
            .storage
            .instances
            .save_instance(&self.inst)
            .await?;
        self.engine.publish(&self.inst);
        Ok(())
    }

    async fn complete(&mut self) -> Result<(), EngineError> {
        match self.cursor.pending_error.clone() {
            Some(err) => self.finish(Err(err)).await,
            None => {
                let output = serde_json::to_vec(&self.cursor.document)?;
                self.finish(Ok(output)).await
            }
        }
    }

    async fn finish(&mut self, result: Result<Vec<u8>, WorkflowError>) -> Result<(), EngineError> {
        if let Some(wait) = self.cursor.wait.take() {
            self.abandon(wait).await;
        }
        self.inst.cursor = self.cursor.to_value();
        self.engine.finalize(&mut self.inst, result).await
    }

    /// Take the first delivery `pick` accepts
    pub(crate) fn take_delivery<T>(&mut self, mut pick: impl FnMut(&Delivery) -> Option<T>) -> Option<T> {
        let index = self.deliveries.iter().position(|d| pick(d).is_some())?;
        let delivery = self.deliveries.remove(index);
        pick(&delivery)
    }
}

fn retry_policy(state: &StateDefinition) -> Option<&RetryDefinition> {
    match &state.kind {
        StateKind::Action(s) => s.action.retries.as_ref(),
        StateKind::Foreach(s) => s.action.retries.as_ref(),
        StateKind::Parallel(s) => s.actions.iter().find_map(|a| a.retries.as_ref()),
        _ => None,
    }
}

/// Back-off before retry `attempt + 1`: `delay * multiplier^attempt`, capped at a day
fn backoff(retry: &RetryDefinition, attempt: u32) -> std::time::Duration {
    let factor = retry.multiplier.unwrap_or(1.0).max(0.0);
    let secs = retry.delay.as_secs_f64() * factor.powi(attempt.min(64) as i32);
    std::time::Duration::try_from_secs_f64(secs.min(86_400.0))
        .unwrap_or(std::time::Duration::from_secs(86_400))
}

/// Retry codes are regular expressions; an empty list matches every code
fn retry_matches(retry: &RetryDefinition, code: &str) -> bool {
    retry.codes.is_empty()
        || retry.codes.iter().any(|pattern| match Regex::new(pattern) {
            Ok(re) => re.is_match(code),
            Err(_) => pattern == code,
        })
}

/// Catch patterns are globs where `*` matches any run of characters
pub(crate) fn glob_match(pattern: &str, code: &str) -> bool {
    let expr = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{expr}$"))
        .map(|re| re.is_match(code))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("timeout.*", "timeout.action"));
        assert!(!glob_match("timeout.*", "direktiv.timeout"));
        assert!(glob_match("direktiv.cancels.timeout.soft", "direktiv.cancels.timeout.soft"));
        assert!(glob_match("a.b", "a.b"));
        assert!(!glob_match("a.b", "axb"));
    }

    #[test]
    fn test_retry_codes() {
        let retry = RetryDefinition {
            max_attempts: 2,
            delay: Duration::ZERO,
            multiplier: None,
            codes: vec!["^io\\.direktiv\\..*".to_string()],
        };
        assert!(retry_matches(&retry, "io.direktiv.command.error"));
        assert!(!retry_matches(&retry, "timeout.action"));

        let doubling = RetryDefinition {
            delay: Duration::from_secs(2),
            multiplier: Some(2.0),
            ..retry.clone()
        };
        assert_eq!(backoff(&doubling, 0), Duration::from_secs(2));
        assert_eq!(backoff(&doubling, 2), Duration::from_secs(8));

        let any = RetryDefinition {
            codes: vec![],
            ..retry
        };
        assert!(retry_matches(&any, "whatever"));
    }
}

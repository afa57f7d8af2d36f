//! Event listeners
//!
//! A listener holds an ordered list of predicates and a combinator:
//!
//! - `Single` fires on the first matching event.
//! - `Xor` fires on the first event matching any predicate and reports which one.
//! - `And` remembers the latest match per predicate and fires once every
//!   predicate has matched; the payload lists events in predicate order.
//!
//! Event ids already seen by a listener are ignored. Listeners owned by an
//! instance are consumed when they fire; start-trigger listeners reset and
//! keep listening.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use direktiv_core::workflow::{EventFilter, StartKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cloudevent::{matches, CloudEvent};
use crate::error::CorrelatorError;

/// Event ids remembered by a persistent listener
const SEEN_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    Single,
    And,
    Xor,
}

impl ListenerKind {
    pub fn for_start(kind: StartKind) -> Option<Self> {
        match kind {
            StartKind::Event => Some(ListenerKind::Single),
            StartKind::EventsAnd => Some(ListenerKind::And),
            StartKind::EventsXor => Some(ListenerKind::Xor),
            StartKind::Default | StartKind::Scheduled => None,
        }
    }
}

/// Who is told when a listener fires
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerOwner {
    /// Start a new instance of the workflow
    StartTrigger { workflow_path: String },
    /// Resume an instance suspended in a state
    Instance { instance_id: Uuid, state: String },
}

/// Listener registration
#[derive(Debug, Clone)]
pub struct ListenerSpec {
    pub namespace: String,
    pub owner: ListenerOwner,
    pub kind: ListenerKind,
    pub filters: Vec<EventFilter>,
    pub deadline: Option<DateTime<Utc>>,
    /// How long an `And` listener keeps a partial match
    pub lifespan: Option<Duration>,
}

impl ListenerSpec {
    pub fn new(
        namespace: impl Into<String>,
        owner: ListenerOwner,
        kind: ListenerKind,
        filters: Vec<EventFilter>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            owner,
            kind,
            filters,
            deadline: None,
            lifespan: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_lifespan(mut self, lifespan: Option<Duration>) -> Self {
        self.lifespan = lifespan;
        self
    }

    fn validate(&self) -> Result<(), CorrelatorError> {
        if self.filters.is_empty() {
            return Err(CorrelatorError::InvalidListener("no event predicates".to_string()));
        }
        if self.kind == ListenerKind::Single && self.filters.len() != 1 {
            return Err(CorrelatorError::InvalidListener(
                "single listener takes exactly one predicate".to_string(),
            ));
        }
        if let Some(f) = self.filters.iter().find(|f| f.event_type.trim().is_empty()) {
            return Err(CorrelatorError::InvalidListener(format!(
                "predicate without event type: {f:?}"
            )));
        }
        Ok(())
    }
}

/// A listener that fired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fired {
    pub listener_id: Uuid,
    pub namespace: String,
    pub owner: ListenerOwner,
    pub kind: ListenerKind,
    /// Matched events in predicate order
    pub events: Vec<CloudEvent>,
    /// Predicate index that fired an `Xor` listener
    pub matched: Option<usize>,
}

/// A listener whose deadline passed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expired {
    pub listener_id: Uuid,
    pub namespace: String,
    pub owner: ListenerOwner,
}

/// Public view of a registered listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerInfo {
    pub id: Uuid,
    pub namespace: String,
    pub owner: ListenerOwner,
    pub kind: ListenerKind,
    pub filters: Vec<EventFilter>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Predicates already satisfied (And listeners)
    pub matched: Vec<bool>,
}

#[derive(Debug, Clone)]
pub(crate) struct Listener {
    pub(crate) id: Uuid,
    pub(crate) spec: ListenerSpec,
    created_at: DateTime<Utc>,
    slots: Vec<Option<(CloudEvent, DateTime<Utc>)>>,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl Listener {
    pub(crate) fn new(spec: ListenerSpec, now: DateTime<Utc>) -> Result<Self, CorrelatorError> {
        spec.validate()?;
        Ok(Self {
            id: Uuid::now_v7(),
            slots: vec![None; spec.filters.len()],
            spec,
            created_at: now,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        })
    }

    pub(crate) fn is_persistent(&self) -> bool {
        matches!(self.spec.owner, ListenerOwner::StartTrigger { .. })
    }

    pub(crate) fn expired(&self, now: DateTime<Utc>) -> bool {
        self.spec.deadline.is_some_and(|d| d <= now)
    }

    fn remember(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.seen_order.push_back(id.to_string());
        if self.seen_order.len() > SEEN_WINDOW {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// Offer an event; returns the payload when the listener fires
    pub(crate) fn offer(&mut self, event: &CloudEvent, now: DateTime<Utc>) -> Option<Fired> {
        let hits: Vec<usize> = self
            .spec
            .filters
            .iter()
            .enumerate()
            .filter(|(_, f)| matches(f, event))
            .map(|(i, _)| i)
            .collect();
        if hits.is_empty() || !self.remember(&event.id) {
            return None;
        }

        let fired = match self.spec.kind {
            ListenerKind::Single | ListenerKind::Xor => Some((vec![event.clone()], Some(hits[0]))),
            ListenerKind::And => {
                if let Some(lifespan) = self.spec.lifespan.and_then(|l| chrono::Duration::from_std(l).ok()) {
                    for slot in self.slots.iter_mut() {
                        if slot.as_ref().is_some_and(|(_, at)| *at + lifespan < now) {
                            *slot = None;
                        }
                    }
                }
                for i in &hits {
                    self.slots[*i] = Some((event.clone(), now));
                }
                if self.slots.iter().all(Option::is_some) {
                    let events = self
                        .slots
                        .iter_mut()
                        .filter_map(|s| s.take().map(|(e, _)| e))
                        .collect();
                    Some((events, None))
                } else {
                    None
                }
            }
        };

        fired.map(|(events, matched)| Fired {
            listener_id: self.id,
            namespace: self.spec.namespace.clone(),
            owner: self.spec.owner.clone(),
            kind: self.spec.kind,
            events,
            matched: if self.spec.kind == ListenerKind::Xor {
                matched
            } else {
                None
            },
        })
    }

    pub(crate) fn info(&self) -> ListenerInfo {
        ListenerInfo {
            id: self.id,
            namespace: self.spec.namespace.clone(),
            owner: self.spec.owner.clone(),
            kind: self.spec.kind,
            filters: self.spec.filters.clone(),
            deadline: self.spec.deadline,
            created_at: self.created_at,
            matched: self.slots.iter().map(Option::is_some).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn and_listener(types: &[&str]) -> Listener {
        Listener::new(
            ListenerSpec::new(
                "ns",
                ListenerOwner::Instance {
                    instance_id: Uuid::new_v4(),
                    state: "wait".into(),
                },
                ListenerKind::And,
                types.iter().map(|t| EventFilter::new(*t)).collect(),
            ),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_and_fires_in_declared_order() {
        let mut l = and_listener(&["a", "b"]);
        let now = Utc::now();
        assert!(l.offer(&CloudEvent::new("b", "s").with_id("1"), now).is_none());
        assert!(l.info().matched == vec![false, true]);
        let fired = l.offer(&CloudEvent::new("a", "s").with_id("2"), now).unwrap();
        let types: Vec<&str> = fired.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["a", "b"]);
        assert_eq!(fired.matched, None);
    }

    #[test]
    fn test_and_keeps_latest_match() {
        let mut l = and_listener(&["a", "b"]);
        let now = Utc::now();
        l.offer(&CloudEvent::new("a", "s").with_id("1"), now);
        l.offer(&CloudEvent::new("a", "s").with_id("2"), now);
        let fired = l.offer(&CloudEvent::new("b", "s").with_id("3"), now).unwrap();
        assert_eq!(fired.events[0].id, "2");
    }

    #[test]
    fn test_duplicate_id_is_ignored() {
        let mut l = and_listener(&["a", "b"]);
        let now = Utc::now();
        l.offer(&CloudEvent::new("a", "s").with_id("1"), now);
        // Same id again, even with another type, does nothing
        assert!(l.offer(&CloudEvent::new("b", "s").with_id("1"), now).is_none());
        assert_eq!(l.info().matched, vec![true, false]);
    }

    #[test]
    fn test_lifespan_drops_stale_partial_matches() {
        let mut l = Listener::new(
            ListenerSpec::new(
                "ns",
                ListenerOwner::StartTrigger {
                    workflow_path: "/wf.yaml".into(),
                },
                ListenerKind::And,
                vec![EventFilter::new("a"), EventFilter::new("b")],
            )
            .with_lifespan(Some(Duration::from_secs(60))),
            Utc::now(),
        )
        .unwrap();
        let t0 = Utc::now();
        l.offer(&CloudEvent::new("a", "s").with_id("1"), t0);
        let later = t0 + chrono::Duration::seconds(120);
        assert!(l.offer(&CloudEvent::new("b", "s").with_id("2"), later).is_none());
        assert_eq!(l.info().matched, vec![false, true]);
    }

    #[test]
    fn test_xor_reports_predicate() {
        let mut l = Listener::new(
            ListenerSpec::new(
                "ns",
                ListenerOwner::StartTrigger {
                    workflow_path: "/wf.yaml".into(),
                },
                ListenerKind::Xor,
                vec![EventFilter::new("a-checked"), EventFilter::new("b-checked")],
            ),
            Utc::now(),
        )
        .unwrap();
        let fired = l
            .offer(&CloudEvent::new("b-checked", "s"), Utc::now())
            .unwrap();
        assert_eq!(fired.matched, Some(1));
        assert_eq!(fired.events.len(), 1);
    }

    #[test]
    fn test_invalid_specs() {
        let owner = ListenerOwner::StartTrigger {
            workflow_path: "/x".into(),
        };
        let now = Utc::now();
        assert!(Listener::new(ListenerSpec::new("ns", owner.clone(), ListenerKind::And, vec![]), now).is_err());
        assert!(Listener::new(
            ListenerSpec::new(
                "ns",
                owner,
                ListenerKind::Single,
                vec![EventFilter::new("a"), EventFilter::new("b")]
            ),
            now,
        )
        .is_err());
    }
}

// Start triggers
// Decision: Event and cron starts are deduplicated cluster-wide through a lease key
// Decision: Trigger tables are rebuilt per namespace whenever its workflows change

use std::sync::Weak;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_core::workflow::StartKind;
use direktiv_core::{FileKind, Invoker, Workflow};
use direktiv_events::{EventSink, Expired, Fired, ListenerKind, ListenerOwner, ListenerSpec};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::engine::{Delivery, Engine, EngineInner, StartRequest};
use crate::error::EngineError;

/// Scheduled start of one workflow
#[derive(Debug, Clone)]
pub(crate) struct CronEntry {
    pub path: String,
    pub pattern: String,
    pub cron: croner::Cron,
    pub next: Option<DateTime<Utc>>,
}

impl CronEntry {
    fn new(path: &str, pattern: &str, now: DateTime<Utc>) -> Result<Self, croner::errors::CronError> {
        let cron = pattern.parse::<croner::Cron>()?;
        let next = cron.find_next_occurrence(&now, false).ok();
        Ok(Self {
            path: path.to_string(),
            pattern: pattern.to_string(),
            cron,
            next,
        })
    }
}

/// Correlator sink; starts instances and wakes waiting ones
pub(crate) struct EngineSink {
    engine: Weak<EngineInner>,
}

impl EngineSink {
    pub fn new(engine: Weak<EngineInner>) -> Self {
        Self { engine }
    }

    fn engine(&self) -> Option<Engine> {
        self.engine.upgrade().map(|inner| Engine { inner })
    }
}

#[async_trait]
impl EventSink for EngineSink {
    async fn fired(&self, fired: Fired) {
        let Some(engine) = self.engine() else {
            return;
        };
        match fired.owner {
            ListenerOwner::StartTrigger { workflow_path } => {
                let ids: Vec<&str> = fired.events.iter().map(|e| e.id.as_str()).collect();
                let key = format!("start:{}:{}:{}", fired.namespace, workflow_path, ids.join(","));
                if !engine.claim(&key).await {
                    debug!(%key, "event start already claimed");
                    return;
                }
                let mut input = Map::new();
                for event in &fired.events {
                    input.insert(event.event_type.clone(), event.to_value());
                }
                let input = serde_json::to_vec(&Value::Object(input)).unwrap_or_default();
                let request = StartRequest::new(&fired.namespace, &workflow_path, input)
                    .with_invoker(Invoker::Event);
                if let Err(e) = engine.start_instance(request).await {
                    warn!(
                        namespace = %fired.namespace,
                        path = %workflow_path,
                        error = %e,
                        "event start failed"
                    );
                }
            }
            ListenerOwner::Instance { instance_id, .. } => engine.deliver(
                instance_id,
                Delivery::Events {
                    listener: fired.listener_id,
                    events: fired.events,
                    matched: fired.matched,
                },
            ),
        }
    }

    async fn expired(&self, expired: Expired) {
        let Some(engine) = self.engine() else {
            return;
        };
        if let ListenerOwner::Instance { instance_id, .. } = expired.owner {
            engine.deliver(
                instance_id,
                Delivery::EventTimeout {
                    listener: expired.listener_id,
                },
            );
        }
    }
}

impl Engine {
    /// Take a dedup key for `dedup_ttl`; false when another start owns it
    async fn claim(&self, key: &str) -> bool {
        match self
            .inner
            .storage
            .leases
            .acquire_lease(key, &self.inner.config.node, self.inner.config.dedup_ttl)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(%key, error = %e, "dedup lease unavailable");
                false
            }
        }
    }

    /// Rebuild the event and cron triggers of a namespace from its workflows
    #[instrument(skip(self))]
    pub async fn sync_triggers(&self, namespace: &str) -> Result<usize, EngineError> {
        let files = self
            .inner
            .storage
            .files
            .list_by_kind(Some(namespace), FileKind::Workflow)
            .await?;
        let now = self.now();
        let mut listeners = Vec::new();
        let mut crons = Vec::new();

        for file in files {
            let workflow = match Workflow::from_yaml(&file.data) {
                Ok(wf) => wf,
                Err(e) => {
                    debug!(path = %file.path, error = %e, "skipping invalid workflow");
                    continue;
                }
            };
            let Some(start) = &workflow.start else {
                continue;
            };
            if let Some(kind) = ListenerKind::for_start(start.kind) {
                let owner = ListenerOwner::StartTrigger {
                    workflow_path: file.path.clone(),
                };
                listeners.push(
                    ListenerSpec::new(namespace, owner, kind, start.filters())
                        .with_lifespan(start.lifespan),
                );
            }
            if start.kind == StartKind::Scheduled {
                let pattern = start.cron.as_deref().unwrap_or_default();
                match CronEntry::new(&file.path, pattern, now) {
                    Ok(entry) => crons.push(entry),
                    Err(e) => warn!(path = %file.path, %pattern, error = %e, "invalid cron pattern"),
                }
            }
        }

        let count = listeners.len() + crons.len();
        self.inner.correlator.replace_triggers(namespace, listeners)?;
        if crons.is_empty() {
            self.inner.crons.write().remove(namespace);
        } else {
            self.inner.crons.write().insert(namespace.to_string(), crons);
        }
        info!(%namespace, count, "triggers synchronized");
        Ok(count)
    }

    pub fn remove_namespace_triggers(&self, namespace: &str) {
        self.inner.correlator.remove_namespace(namespace);
        self.inner.crons.write().remove(namespace);
    }

    /// Start every scheduled workflow that is due; returns how many started here
    pub async fn cron_tick(&self) -> usize {
        let now = self.now();
        let mut due = Vec::new();
        {
            let mut crons = self.inner.crons.write();
            for (namespace, entries) in crons.iter_mut() {
                for entry in entries.iter_mut() {
                    let Some(at) = entry.next.filter(|at| *at <= now) else {
                        continue;
                    };
                    due.push((namespace.clone(), entry.path.clone(), at));
                    entry.next = entry.cron.find_next_occurrence(&now, false).ok();
                }
            }
        }

        let mut started = 0;
        for (namespace, path, at) in due {
            let key = format!("cron:{namespace}:{path}:{}", at.timestamp());
            if !self.claim(&key).await {
                continue;
            }
            let request = StartRequest::new(&namespace, &path, Vec::new()).with_invoker(Invoker::Cron);
            match self.start_instance(request).await {
                Ok(_) => started += 1,
                Err(e) => warn!(%namespace, %path, error = %e, "scheduled start failed"),
            }
        }
        started
    }

    /// Cron patterns by namespace, with their next fire time
    pub fn schedules(&self, namespace: &str) -> Vec<(String, String, Option<DateTime<Utc>>)> {
        self.inner
            .crons
            .read()
            .get(namespace)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (e.path.clone(), e.pattern.clone(), e.next))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_entry_next_fire() {
        let now = "2024-01-01T10:00:30Z".parse::<DateTime<Utc>>().unwrap();
        let entry = CronEntry::new("/wf.yaml", "* * * * *", now).unwrap();
        assert_eq!(
            entry.next.unwrap(),
            "2024-01-01T10:01:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert!(CronEntry::new("/wf.yaml", "not a cron", now).is_err());
    }
}

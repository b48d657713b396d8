//! Process lifecycle events
//!
//! Published on entry into an announced state and on every failure.
//! Publishing is fire-and-forget: a failed publish is logged by the caller
//! and never rolls back the transition that produced it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::entity::{EntityId, ProcessState, StatefulEntity};

/// Where a participant wants to hear about a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAddress {
    pub uri: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub transactional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEvent {
    /// Entity kind, e.g. "contract_negotiation"
    pub process_type: &'static str,
    /// Machine that produced the event, e.g. "negotiation-consumer"
    pub source: String,
    pub process_id: EntityId,
    pub from_state: String,
    pub state: String,
    pub state_code: i32,
    pub failed: bool,
    pub error_detail: Option<String>,
    pub at: i64,
    pub trace_context: BTreeMap<String, String>,
}

impl ProcessEvent {
    pub fn for_entity<T: StatefulEntity>(
        source: &str,
        entity: &T,
        from: T::State,
        failed: bool,
        at: i64,
    ) -> Self {
        let meta = entity.meta();
        Self {
            process_type: T::KIND,
            source: source.to_string(),
            process_id: meta.id,
            from_state: from.as_str().to_string(),
            state: entity
                .state()
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| meta.state.to_string()),
            state_code: meta.state,
            failed,
            error_detail: meta.error_detail.clone(),
            at,
            trace_context: meta.trace_context.clone(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("Event channel closed")]
    Closed,

    #[error("Event sink unavailable: {0}")]
    Unavailable(String),
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: ProcessEvent) -> Result<(), PublishError>;
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventPublisher;

impl EventPublisher for NoopEventPublisher {
    fn publish(&self, _event: ProcessEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel
///
/// Slow subscribers lag and lose the oldest events; publishing never blocks.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    tx: broadcast::Sender<ProcessEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastEventPublisher {
    fn publish(&self, event: ProcessEvent) -> Result<(), PublishError> {
        // no subscriber is not an error; nobody asked to listen
        if self.tx.receiver_count() == 0 {
            return Ok(());
        }
        self.tx.send(event).map(|_| ()).map_err(|_| PublishError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fixtures::{Job, JobState};

    fn event() -> ProcessEvent {
        let mut job = Job::new("j", JobState::Queued, 0);
        job.meta.transition(JobState::Running.code(), 5);
        ProcessEvent::for_entity("jobs", &job, JobState::Queued, false, 5)
    }

    #[test]
    fn test_event_from_entity() {
        let e = event();
        assert_eq!(e.process_type, "job");
        assert_eq!(e.from_state, "QUEUED");
        assert_eq!(e.state, "RUNNING");
        assert_eq!(e.state_code, 20);

        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["processType"], "job");
        assert_eq!(json["fromState"], "QUEUED");
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let publisher = BroadcastEventPublisher::new(8);
        // without subscribers publish is a no-op
        publisher.publish(event()).unwrap();

        let mut rx = publisher.subscribe();
        publisher.publish(event()).unwrap();
        assert_eq!(rx.recv().await.unwrap().state, "RUNNING");
    }
}

//! Remote message dispatch
//!
//! Handlers hand protocol messages to a [`DispatcherRegistry`], which routes
//! them by protocol name to a [`RemoteMessageDispatcher`]. How a dispatch
//! failure affects the process is decided by [`DispatchError::outcome`]:
//! an unreachable counterparty is retried, a refusal is final.

pub mod loopback;
pub mod message;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use loopback::LoopbackDispatcher;
pub use message::{DispatchAck, MessageBody, NegotiationEventType, Origin, RemoteMessage};

use crate::entity::ProcessState;
use crate::state_machine::StepOutcome;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Counterparty unreachable or busy; worth retrying
    #[error("Counterparty unavailable: {0}")]
    Unavailable(String),

    /// Counterparty refused the message
    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("No dispatcher for protocol '{0}'")]
    UnsupportedProtocol(String),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Unavailable(_) => "UNAVAILABLE",
            DispatchError::Rejected(_) => "REJECTED",
            DispatchError::UnsupportedProtocol(_) => "UNSUPPORTED_PROTOCOL",
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Unavailable(_))
    }

    /// Handler outcome for a failed send of `what`
    pub fn outcome<S: ProcessState>(&self, what: &str) -> StepOutcome<S> {
        let reason = format!("{what}: {self}");
        if self.is_retryable() {
            StepOutcome::Retry(reason)
        } else {
            StepOutcome::Fatal(reason)
        }
    }
}

#[async_trait]
pub trait RemoteMessageDispatcher: Send + Sync {
    fn protocol(&self) -> &str;

    async fn send(&self, message: RemoteMessage) -> Result<DispatchAck, DispatchError>;
}

/// Inbound side of a participant
#[async_trait]
pub trait ProtocolReceiver: Send + Sync {
    async fn receive(&self, message: RemoteMessage) -> Result<DispatchAck, DispatchError>;
}

#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: HashMap<String, Arc<dyn RemoteMessageDispatcher>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, dispatcher: Arc<dyn RemoteMessageDispatcher>) {
        self.dispatchers
            .insert(dispatcher.protocol().to_string(), dispatcher);
    }

    pub fn with(mut self, dispatcher: Arc<dyn RemoteMessageDispatcher>) -> Self {
        self.register(dispatcher);
        self
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.dispatchers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub async fn send(&self, message: RemoteMessage) -> Result<DispatchAck, DispatchError> {
        let dispatcher = self
            .dispatchers
            .get(&message.protocol)
            .ok_or_else(|| DispatchError::UnsupportedProtocol(message.protocol.clone()))?;
        dispatcher.send(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fixtures::JobState;
    use crate::state_machine::StepOutcome;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<RemoteMessage>>,
        reply: Result<DispatchAck, DispatchError>,
    }

    #[async_trait]
    impl ProtocolReceiver for Recorder {
        async fn receive(&self, message: RemoteMessage) -> Result<DispatchAck, DispatchError> {
            self.seen.lock().unwrap().push(message);
            self.reply.clone()
        }
    }

    fn message(protocol: &str, address: &str) -> RemoteMessage {
        RemoteMessage {
            protocol: protocol.into(),
            counterparty_address: address.into(),
            sender_id: "consumer".into(),
            trace_context: [("traceparent".to_string(), "00-abc".to_string())]
                .into_iter()
                .collect(),
            body: MessageBody::TransferCompletion {
                consumer_pid: "c1".into(),
                provider_pid: "p1".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_loopback_round_trips_message() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            reply: Ok(DispatchAck::created("p-42")),
        });
        let receiver: Arc<dyn ProtocolReceiver> = recorder.clone();
        let loopback = Arc::new(LoopbackDispatcher::new("dsp"));
        loopback.register("mem://provider", &receiver);
        let registry = DispatcherRegistry::new().with(loopback);

        let ack = registry.send(message("dsp", "mem://provider")).await.unwrap();

        assert_eq!(ack.process_id.as_deref(), Some("p-42"));
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], message("dsp", "mem://provider"));
    }

    #[tokio::test]
    async fn test_routing_failures() {
        let loopback = Arc::new(LoopbackDispatcher::new("dsp"));
        let registry = DispatcherRegistry::new().with(loopback.clone());

        let err = registry.send(message("other", "mem://x")).await.unwrap_err();
        assert_eq!(err, DispatchError::UnsupportedProtocol("other".into()));

        let err = registry.send(message("dsp", "mem://nobody")).await.unwrap_err();
        assert!(err.is_retryable());

        // a dropped receiver is unreachable, not kept alive
        let receiver: Arc<dyn ProtocolReceiver> = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            reply: Ok(DispatchAck::empty()),
        });
        loopback.register("mem://gone", &receiver);
        drop(receiver);
        let err = registry.send(message("dsp", "mem://gone")).await.unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
    }

    #[test]
    fn test_outcome_mapping() {
        let retry: StepOutcome<JobState> =
            DispatchError::Unavailable("timeout".into()).outcome("send request");
        assert!(matches!(retry, StepOutcome::Retry(r) if r.contains("send request")));

        let fatal: StepOutcome<JobState> =
            DispatchError::Rejected("unknown process".into()).outcome("send request");
        assert!(matches!(fatal, StepOutcome::Fatal(_)));

        let fatal: StepOutcome<JobState> =
            DispatchError::UnsupportedProtocol("x".into()).outcome("send");
        assert!(matches!(fatal, StepOutcome::Fatal(_)));
    }
}

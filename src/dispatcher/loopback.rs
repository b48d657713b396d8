//! In-process dispatcher
//!
//! Delivers messages to a [`ProtocolReceiver`] registered under the
//! counterparty address. Messages go through a JSON encode/decode on the
//! way, so only what survives serialization reaches the receiver.
//! Receivers are held weakly: a connector owns its dispatcher, and the
//! dispatcher must not keep connectors alive.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::message::{DispatchAck, RemoteMessage};
use super::{DispatchError, ProtocolReceiver, RemoteMessageDispatcher};

pub struct LoopbackDispatcher {
    protocol: String,
    receivers: DashMap<String, Weak<dyn ProtocolReceiver>>,
}

impl LoopbackDispatcher {
    pub fn new(protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            receivers: DashMap::new(),
        }
    }

    pub fn register(&self, address: &str, receiver: &Arc<dyn ProtocolReceiver>) {
        self.receivers
            .insert(address.to_string(), Arc::downgrade(receiver));
    }

    pub fn unregister(&self, address: &str) {
        self.receivers.remove(address);
    }
}

#[async_trait]
impl RemoteMessageDispatcher for LoopbackDispatcher {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn send(&self, message: RemoteMessage) -> Result<DispatchAck, DispatchError> {
        let receiver = self
            .receivers
            .get(&message.counterparty_address)
            .and_then(|r| r.value().upgrade())
            .ok_or_else(|| {
                DispatchError::Unavailable(format!(
                    "no participant at {}",
                    message.counterparty_address
                ))
            })?;

        let wire = serde_json::to_vec(&message)
            .map_err(|e| DispatchError::Rejected(format!("encode: {e}")))?;
        let delivered: RemoteMessage = serde_json::from_slice(&wire)
            .map_err(|e| DispatchError::Rejected(format!("decode: {e}")))?;

        debug!(
            address = %delivered.counterparty_address,
            kind = delivered.body.name(),
            bytes = wire.len(),
            "Loopback delivery"
        );
        receiver.receive(delivered).await
    }
}

//! Protocol messages exchanged between participants
//!
//! Only the content the state machines need is modelled here; the wire
//! encoding belongs to the dispatcher that carries the message.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::negotiation::{ContractAgreement, ContractOffer};
use crate::transfer::DataAddress;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    /// Dispatcher routing key
    pub protocol: String,
    pub counterparty_address: String,
    /// Participant id of the sender
    pub sender_id: String,
    #[serde(default)]
    pub trace_context: BTreeMap<String, String>,
    pub body: MessageBody,
}

impl RemoteMessage {
    pub fn origin(&self) -> Origin<'_> {
        Origin {
            sender_id: &self.sender_id,
            protocol: &self.protocol,
            trace_context: &self.trace_context,
        }
    }
}

/// Sender-side facts of an inbound message
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    pub sender_id: &'a str,
    pub protocol: &'a str,
    pub trace_context: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationEventType {
    Accepted,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageBody {
    ContractRequest {
        consumer_pid: String,
        provider_pid: Option<String>,
        offer: ContractOffer,
        callback_address: String,
    },
    ContractOffer {
        provider_pid: String,
        consumer_pid: Option<String>,
        offer: ContractOffer,
        callback_address: String,
    },
    ContractAgreement {
        consumer_pid: String,
        provider_pid: String,
        agreement: ContractAgreement,
    },
    NegotiationEvent {
        consumer_pid: String,
        provider_pid: String,
        event: NegotiationEventType,
    },
    AgreementVerification {
        consumer_pid: String,
        provider_pid: String,
    },
    NegotiationTermination {
        consumer_pid: String,
        provider_pid: String,
        reason: Option<String>,
    },
    TransferRequest {
        consumer_pid: String,
        agreement_id: String,
        asset_id: String,
        transfer_type: String,
        data_destination: Option<DataAddress>,
        callback_address: String,
    },
    TransferStart {
        consumer_pid: String,
        provider_pid: String,
        data_address: Option<DataAddress>,
    },
    TransferSuspension {
        consumer_pid: String,
        provider_pid: String,
        reason: Option<String>,
    },
    TransferCompletion {
        consumer_pid: String,
        provider_pid: String,
    },
    TransferTermination {
        consumer_pid: String,
        provider_pid: String,
        reason: Option<String>,
    },
}

impl MessageBody {
    pub fn name(&self) -> &'static str {
        match self {
            MessageBody::ContractRequest { .. } => "ContractRequest",
            MessageBody::ContractOffer { .. } => "ContractOffer",
            MessageBody::ContractAgreement { .. } => "ContractAgreement",
            MessageBody::NegotiationEvent { .. } => "NegotiationEvent",
            MessageBody::AgreementVerification { .. } => "AgreementVerification",
            MessageBody::NegotiationTermination { .. } => "NegotiationTermination",
            MessageBody::TransferRequest { .. } => "TransferRequest",
            MessageBody::TransferStart { .. } => "TransferStart",
            MessageBody::TransferSuspension { .. } => "TransferSuspension",
            MessageBody::TransferCompletion { .. } => "TransferCompletion",
            MessageBody::TransferTermination { .. } => "TransferTermination",
        }
    }

    /// Whether the message belongs to a contract negotiation
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            MessageBody::ContractRequest { .. }
                | MessageBody::ContractOffer { .. }
                | MessageBody::ContractAgreement { .. }
                | MessageBody::NegotiationEvent { .. }
                | MessageBody::AgreementVerification { .. }
                | MessageBody::NegotiationTermination { .. }
        )
    }
}

/// Receiver's answer to a delivered message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchAck {
    /// Receiver-side process id, set when the message created a process
    pub process_id: Option<String>,
}

impl DispatchAck {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn created(process_id: impl Into<String>) -> Self {
        Self {
            process_id: Some(process_id.into()),
        }
    }
}

//! Contract Negotiation
//!
//! Consumer and provider agree on a usage contract for one asset. Both
//! roles persist into the same store; each role has its own graph and its
//! own manager, which claims only entities of its role.
//!
//! ```text
//! consumer                              provider
//! INITIAL -> REQUESTING --request-->    REQUESTED -> AGREEING
//! REQUESTED  <--------agreement-------  AGREEING -> AGREED
//! AGREED -> VERIFYING --verification--> VERIFIED -> FINALIZING
//! FINALIZED  <--------finalized-------  FINALIZING -> FINALIZED
//! ```

pub mod consumer;
pub mod error;
pub mod provider;
pub mod service;
pub mod state;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use error::NegotiationError;
pub use service::{AgreementLookup, NegotiationService};
pub use state::{NegotiationState, graph_for_role};
pub use types::{ContractAgreement, ContractNegotiation, ContractOffer, NegotiationParty};

use crate::clock::Clock;
use crate::dispatcher::{DispatchAck, DispatchError, DispatcherRegistry, MessageBody, RemoteMessage};
use crate::entity::StatefulEntity;
use crate::policy::PolicyEvaluator;
use crate::state_machine::{HandlerFuture, StateGraph, StepOutcome};

/// Collaborators shared by the negotiation handlers of one participant
pub struct NegotiationContext {
    pub participant_id: String,
    /// Address counterparties reach this participant at
    pub callback_address: String,
    pub dispatcher: Arc<DispatcherRegistry>,
    pub policy: Arc<dyn PolicyEvaluator>,
    pub clock: Arc<dyn Clock>,
}

impl NegotiationContext {
    pub(crate) async fn send(
        &self,
        negotiation: &ContractNegotiation,
        body: MessageBody,
    ) -> Result<DispatchAck, DispatchError> {
        let message = RemoteMessage {
            protocol: negotiation.protocol.clone(),
            counterparty_address: negotiation.counterparty_address.clone(),
            sender_id: self.participant_id.clone(),
            trace_context: negotiation.meta.trace_context.clone(),
            body,
        };
        self.dispatcher.send(message).await
    }
}

/// Graph of the role `negotiation` plays
pub fn graph_of(negotiation: &ContractNegotiation) -> Arc<StateGraph<NegotiationState>> {
    graph_for_role(negotiation.role)
}

/// TERMINATING, identical for both roles: tell the counterparty if it knows
/// about us, then end
pub(crate) fn terminating<'a>(
    ctx: &'a NegotiationContext,
    n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move {
        let Some((consumer_pid, provider_pid)) = n.pids() else {
            return Ok(StepOutcome::Transition(NegotiationState::Terminated));
        };
        let body = MessageBody::NegotiationTermination {
            consumer_pid,
            provider_pid,
            reason: n.meta.error_detail.clone(),
        };
        match ctx.send(n, body).await {
            Ok(_) => Ok(StepOutcome::Transition(NegotiationState::Terminated)),
            Err(e) => Ok(e.outcome("NegotiationTermination")),
        }
    })
}

/// Trace context copied from an inbound message onto a new process
pub(crate) fn inherit_trace(n: &mut ContractNegotiation, trace: &BTreeMap<String, String>) {
    n.meta_mut()
        .trace_context
        .extend(trace.iter().map(|(k, v)| (k.clone(), v.clone())));
}

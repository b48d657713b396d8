//! Provider-side negotiation handlers

use std::sync::Arc;

use super::state::NegotiationState::{self, *};
use super::types::{ContractAgreement, ContractNegotiation};
use super::{NegotiationContext, graph_for_role, terminating};
use crate::dispatcher::{MessageBody, NegotiationEventType};
use crate::entity::{Role, StatefulEntity};
use crate::policy::{PolicyContext, PolicyVerdict};
use crate::state_machine::{EngineError, FnHandler, HandlerFuture, StateMachine, StepOutcome};
use crate::store::Criterion;

pub const MACHINE: &str = "negotiation-provider";

pub fn machine(
    ctx: Arc<NegotiationContext>,
) -> Result<StateMachine<ContractNegotiation>, EngineError> {
    Ok(
        StateMachine::new(MACHINE, graph_for_role(Role::Provider), Terminated)?
            .on(Initial, FnHandler::new(ctx.clone(), initial))?
            .on(Offering, FnHandler::new(ctx.clone(), offering))?
            .on(Requested, FnHandler::new(ctx.clone(), requested))?
            .on(Accepted, FnHandler::new(ctx.clone(), accepted))?
            .on(Agreeing, FnHandler::new(ctx.clone(), agreeing))?
            .on(Verified, FnHandler::new(ctx.clone(), verified))?
            .on(Finalizing, FnHandler::new(ctx.clone(), finalizing))?
            .on(Terminating, FnHandler::new(ctx, terminating))?
            .with_filter(vec![Criterion::equal("role", Role::Provider.as_str())]),
    )
}

fn initial<'a>(
    _ctx: &'a NegotiationContext,
    _n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move { Ok(StepOutcome::Transition(Offering)) })
}

fn offering<'a>(
    ctx: &'a NegotiationContext,
    n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move {
        let Some(offer) = n.last_offer().cloned() else {
            return Ok(StepOutcome::fatal("no contract offer to send"));
        };
        let body = MessageBody::ContractOffer {
            provider_pid: n.pid(),
            consumer_pid: n.correlation_id.clone(),
            offer,
            callback_address: ctx.callback_address.clone(),
        };

        let ack = match ctx.send(n, body).await {
            Ok(ack) => ack,
            Err(e) => return Ok(e.outcome("ContractOffer")),
        };
        if n.correlation_id.is_none() {
            match ack.process_id {
                Some(pid) => n.correlation_id = Some(pid),
                None => return Ok(StepOutcome::fatal("consumer did not return a process id")),
            }
        }
        Ok(StepOutcome::Transition(Offered))
    })
}

/// Evaluate the requested offer against the requesting consumer
fn requested<'a>(
    ctx: &'a NegotiationContext,
    n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move {
        let Some(offer) = n.last_offer() else {
            return Ok(StepOutcome::fatal("no contract offer to evaluate"));
        };
        let policy_ctx = PolicyContext::new(&n.counterparty_id);
        match ctx.policy.evaluate(&offer.policy, &policy_ctx) {
            PolicyVerdict::Valid => Ok(StepOutcome::Transition(Agreeing)),
            PolicyVerdict::Violations(v) => Ok(StepOutcome::fatal(format!(
                "policy violation: {}",
                v.join("; ")
            ))),
        }
    })
}

fn accepted<'a>(
    _ctx: &'a NegotiationContext,
    _n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move { Ok(StepOutcome::Transition(Agreeing)) })
}

/// Send the agreement until delivered; it is attached only with AGREED
///
/// The id derives from the negotiation, so every resend carries the same
/// agreement and a TERMINATED negotiation never holds one.
fn agreeing<'a>(
    ctx: &'a NegotiationContext,
    n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move {
        let Some((consumer_pid, provider_pid)) = n.pids() else {
            return Ok(StepOutcome::fatal("consumer process id unknown"));
        };
        let agreement = match n.agreement() {
            Some(existing) => existing.clone(),
            None => {
                let Some(offer) = n.last_offer() else {
                    return Ok(StepOutcome::fatal("no contract offer to agree on"));
                };
                ContractAgreement {
                    id: agreement_id(n),
                    provider_id: ctx.participant_id.clone(),
                    consumer_id: n.counterparty_id.clone(),
                    asset_id: offer.asset_id.clone(),
                    policy: offer.policy.clone(),
                    signed_at: ctx.clock.now_millis(),
                }
            }
        };

        let body = MessageBody::ContractAgreement {
            consumer_pid,
            provider_pid,
            agreement: agreement.clone(),
        };
        match ctx.send(n, body).await {
            Ok(_) => {
                if let Err(reason) = n.attach_agreement(agreement) {
                    return Ok(StepOutcome::fatal(reason));
                }
                Ok(StepOutcome::Transition(Agreed))
            }
            Err(e) => Ok(e.outcome("ContractAgreement")),
        }
    })
}

fn agreement_id(n: &ContractNegotiation) -> String {
    format!("agreement-{}", n.id())
}

fn verified<'a>(
    _ctx: &'a NegotiationContext,
    _n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move { Ok(StepOutcome::Transition(Finalizing)) })
}

fn finalizing<'a>(
    ctx: &'a NegotiationContext,
    n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move {
        let Some((consumer_pid, provider_pid)) = n.pids() else {
            return Ok(StepOutcome::fatal("consumer process id unknown"));
        };
        let body = MessageBody::NegotiationEvent {
            consumer_pid,
            provider_pid,
            event: NegotiationEventType::Finalized,
        };
        match ctx.send(n, body).await {
            Ok(_) => Ok(StepOutcome::Transition(Finalized)),
            Err(e) => Ok(e.outcome("NegotiationEvent(FINALIZED)")),
        }
    })
}

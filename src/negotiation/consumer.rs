//! Consumer-side negotiation handlers

use std::sync::Arc;

use super::state::NegotiationState::{self, *};
use super::types::ContractNegotiation;
use super::{NegotiationContext, graph_for_role, terminating};
use crate::dispatcher::{MessageBody, NegotiationEventType};
use crate::entity::Role;
use crate::policy::{PolicyContext, PolicyVerdict};
use crate::state_machine::{EngineError, FnHandler, HandlerFuture, StateMachine, StepOutcome};
use crate::store::Criterion;

pub const MACHINE: &str = "negotiation-consumer";

pub fn machine(
    ctx: Arc<NegotiationContext>,
) -> Result<StateMachine<ContractNegotiation>, EngineError> {
    Ok(
        StateMachine::new(MACHINE, graph_for_role(Role::Consumer), Terminated)?
            .on(Initial, FnHandler::new(ctx.clone(), initial))?
            .on(Requesting, FnHandler::new(ctx.clone(), requesting))?
            .on(Accepting, FnHandler::new(ctx.clone(), accepting))?
            .on(Agreed, FnHandler::new(ctx.clone(), agreed))?
            .on(Verifying, FnHandler::new(ctx.clone(), verifying))?
            .on(Terminating, FnHandler::new(ctx, terminating))?
            .with_filter(vec![Criterion::equal("role", Role::Consumer.as_str())]),
    )
}

fn initial<'a>(
    _ctx: &'a NegotiationContext,
    _n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move { Ok(StepOutcome::Transition(Requesting)) })
}

fn requesting<'a>(
    ctx: &'a NegotiationContext,
    n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move {
        let Some(offer) = n.last_offer().cloned() else {
            return Ok(StepOutcome::fatal("no contract offer to request"));
        };
        let body = MessageBody::ContractRequest {
            consumer_pid: n.pid(),
            provider_pid: n.correlation_id.clone(),
            offer,
            callback_address: ctx.callback_address.clone(),
        };

        let ack = match ctx.send(n, body).await {
            Ok(ack) => ack,
            Err(e) => return Ok(e.outcome("ContractRequest")),
        };
        if n.correlation_id.is_none() {
            match ack.process_id {
                Some(pid) => n.correlation_id = Some(pid),
                None => return Ok(StepOutcome::fatal("provider did not return a process id")),
            }
        }
        Ok(StepOutcome::Transition(Requested))
    })
}

fn accepting<'a>(
    ctx: &'a NegotiationContext,
    n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move {
        let Some((consumer_pid, provider_pid)) = n.pids() else {
            return Ok(StepOutcome::fatal("provider process id unknown"));
        };
        let body = MessageBody::NegotiationEvent {
            consumer_pid,
            provider_pid,
            event: NegotiationEventType::Accepted,
        };
        match ctx.send(n, body).await {
            Ok(_) => Ok(StepOutcome::Transition(Accepted)),
            Err(e) => Ok(e.outcome("NegotiationEvent(ACCEPTED)")),
        }
    })
}

/// Check what the provider agreed to before confirming it
fn agreed<'a>(
    ctx: &'a NegotiationContext,
    n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move {
        let (Some(agreement), Some(offer)) = (n.agreement(), n.last_offer()) else {
            return Ok(StepOutcome::fatal("agreement or offer missing"));
        };
        if agreement.asset_id != offer.asset_id {
            return Ok(StepOutcome::fatal(format!(
                "agreement asset {} does not match offered asset {}",
                agreement.asset_id, offer.asset_id
            )));
        }
        if agreement.consumer_id != ctx.participant_id {
            return Ok(StepOutcome::fatal(format!(
                "agreement issued to {}, not to {}",
                agreement.consumer_id, ctx.participant_id
            )));
        }
        let policy_ctx = PolicyContext::new(&ctx.participant_id);
        if let PolicyVerdict::Violations(v) = ctx.policy.evaluate(&agreement.policy, &policy_ctx) {
            return Ok(StepOutcome::fatal(format!(
                "agreement policy invalid: {}",
                v.join("; ")
            )));
        }
        Ok(StepOutcome::Transition(Verifying))
    })
}

fn verifying<'a>(
    ctx: &'a NegotiationContext,
    n: &'a mut ContractNegotiation,
) -> HandlerFuture<'a, NegotiationState> {
    Box::pin(async move {
        let Some((consumer_pid, provider_pid)) = n.pids() else {
            return Ok(StepOutcome::fatal("provider process id unknown"));
        };
        let body = MessageBody::AgreementVerification {
            consumer_pid,
            provider_pid,
        };
        match ctx.send(n, body).await {
            Ok(_) => Ok(StepOutcome::Transition(Verified)),
            Err(e) => Ok(e.outcome("AgreementVerification")),
        }
    })
}

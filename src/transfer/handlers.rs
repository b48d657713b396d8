//! Transfer process handlers for both roles

use std::sync::Arc;
use tracing::{info, warn};

use super::data_flow::DataFlowController;
use super::provision::{DeprovisionResult, ProvisionResult, ProvisionerRegistry};
use super::state::{TransferState::{self, *}, transfer_graph};
use super::types::TransferProcess;
use crate::clock::Clock;
use crate::dispatcher::{DispatchAck, DispatchError, DispatcherRegistry, MessageBody, RemoteMessage};
use crate::entity::{EntityId, Role, StatefulEntity};
use crate::negotiation::AgreementLookup;
use crate::policy::{PolicyContext, PolicyEvaluator, PolicyVerdict};
use crate::state_machine::{EngineError, FnHandler, HandlerFuture, StateMachine, StepOutcome};
use crate::store::Criterion;
use crate::vault::{Vault, VaultError};

pub const CONSUMER_MACHINE: &str = "transfer-consumer";
pub const PROVIDER_MACHINE: &str = "transfer-provider";

/// Collaborators shared by the transfer handlers of one participant
pub struct TransferContext {
    pub participant_id: String,
    pub callback_address: String,
    pub dispatcher: Arc<DispatcherRegistry>,
    pub agreements: Arc<dyn AgreementLookup>,
    pub policy: Arc<dyn PolicyEvaluator>,
    pub provisioners: Arc<ProvisionerRegistry>,
    pub data_flow: Arc<dyn DataFlowController>,
    pub vault: Arc<dyn Vault>,
    pub clock: Arc<dyn Clock>,
}

impl TransferContext {
    async fn send(
        &self,
        process: &TransferProcess,
        body: MessageBody,
    ) -> Result<DispatchAck, DispatchError> {
        let message = RemoteMessage {
            protocol: process.data_request.protocol.clone(),
            counterparty_address: process.data_request.counterparty_address.clone(),
            sender_id: self.participant_id.clone(),
            trace_context: process.meta.trace_context.clone(),
            body,
        };
        self.dispatcher.send(message).await
    }
}

/// Vault key of the secret belonging to one manifest entry
pub fn secret_key(process_id: EntityId, definition_id: &str) -> String {
    format!("{process_id}-{definition_id}")
}

pub fn consumer_machine(
    ctx: Arc<TransferContext>,
) -> Result<StateMachine<TransferProcess>, EngineError> {
    Ok(StateMachine::new(CONSUMER_MACHINE, transfer_graph(), Terminated)?
        .on(Initial, FnHandler::new(ctx.clone(), consumer_initial))?
        .on(Provisioning, FnHandler::new(ctx.clone(), provisioning))?
        .on(Provisioned, FnHandler::new(ctx.clone(), consumer_provisioned))?
        .on(Requesting, FnHandler::new(ctx.clone(), requesting))?
        .on(Suspending, FnHandler::new(ctx.clone(), suspending))?
        .on(Resuming, FnHandler::new(ctx.clone(), consumer_resuming))?
        .on(Completing, FnHandler::new(ctx.clone(), completing))?
        .on(Terminating, FnHandler::new(ctx.clone(), terminating))?
        .on(Deprovisioning, FnHandler::new(ctx, deprovisioning))?
        .with_filter(vec![Criterion::equal("role", Role::Consumer.as_str())]))
}

pub fn provider_machine(
    ctx: Arc<TransferContext>,
) -> Result<StateMachine<TransferProcess>, EngineError> {
    Ok(StateMachine::new(PROVIDER_MACHINE, transfer_graph(), Terminated)?
        .on(Initial, FnHandler::new(ctx.clone(), provider_initial))?
        .on(Provisioning, FnHandler::new(ctx.clone(), provisioning))?
        .on(Provisioned, FnHandler::new(ctx.clone(), provider_provisioned))?
        .on(Starting, FnHandler::new(ctx.clone(), starting))?
        .on(Suspending, FnHandler::new(ctx.clone(), suspending))?
        .on(Resuming, FnHandler::new(ctx.clone(), provider_resuming))?
        .on(Completing, FnHandler::new(ctx.clone(), completing))?
        .on(Terminating, FnHandler::new(ctx.clone(), terminating))?
        .on(Deprovisioning, FnHandler::new(ctx, deprovisioning))?
        .with_filter(vec![Criterion::equal("role", Role::Provider.as_str())]))
}

fn consumer_initial<'a>(
    _ctx: &'a TransferContext,
    _p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move { Ok(StepOutcome::Transition(Provisioning)) })
}

/// The agreement must be finalized and still permit the requester
fn provider_initial<'a>(
    ctx: &'a TransferContext,
    p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move {
        let agreement_id = &p.data_request.agreement_id;
        let Some(agreement) = ctx.agreements.finalized_agreement(agreement_id).await? else {
            return Ok(StepOutcome::fatal(format!(
                "agreement {agreement_id} is not finalized"
            )));
        };
        let policy_ctx = PolicyContext::new(&p.data_request.counterparty_id);
        match ctx.policy.evaluate(&agreement.policy, &policy_ctx) {
            PolicyVerdict::Valid => Ok(StepOutcome::Transition(Provisioning)),
            PolicyVerdict::Violations(v) => Ok(StepOutcome::fatal(format!(
                "policy violation: {}",
                v.join("; ")
            ))),
        }
    })
}

/// Fan out over every manifest entry not provisioned yet
///
/// Successes are recorded even when another entry fails, so a retry only
/// repeats the failed entries.
fn provisioning<'a>(
    ctx: &'a TransferContext,
    p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move {
        let id = p.id();
        let pending: Vec<_> = p.unprovisioned().cloned().collect();
        let mut in_progress = false;
        let mut failures = Vec::new();

        for definition in pending {
            let Some(provisioner) = ctx.provisioners.for_definition(&definition) else {
                if definition.mandatory {
                    return Ok(StepOutcome::fatal(format!(
                        "no provisioner for resource {} of kind {}",
                        definition.id, definition.kind
                    )));
                }
                warn!(transfer_id = %id, resource = %definition.id, kind = %definition.kind, "No provisioner for optional resource, skipped");
                continue;
            };

            match provisioner.provision(id, &definition).await {
                ProvisionResult::Provisioned {
                    mut resource,
                    secret,
                } => {
                    if let Some(secret) = secret {
                        let key = secret_key(id, &definition.id);
                        if let Err(e) = ctx.vault.store_secret(&key, &secret) {
                            if definition.mandatory {
                                failures.push(format!("resource {}: {e}", definition.id));
                            } else {
                                warn!(transfer_id = %id, resource = %definition.id, error = %e, "Secret not stored, optional resource skipped");
                            }
                            continue;
                        }
                        resource.secret_key = Some(key);
                    }
                    info!(transfer_id = %id, resource = %definition.id, provisioner = provisioner.name(), "Resource provisioned");
                    p.add_provisioned(resource);
                }
                ProvisionResult::InProgress if definition.mandatory => in_progress = true,
                ProvisionResult::InProgress => {
                    info!(transfer_id = %id, resource = %definition.id, "Optional resource provisioning continues asynchronously");
                }
                ProvisionResult::Failed(message) if definition.mandatory => {
                    failures.push(format!("resource {}: {message}", definition.id));
                }
                ProvisionResult::Failed(message) => {
                    warn!(transfer_id = %id, resource = %definition.id, error = %message, "Optional resource failed, skipped");
                }
            }
        }

        if !failures.is_empty() {
            return Ok(StepOutcome::retry(failures.join("; ")));
        }
        if in_progress {
            return Ok(StepOutcome::Transition(ProvisioningRequested));
        }
        Ok(StepOutcome::Transition(Provisioned))
    })
}

fn consumer_provisioned<'a>(
    _ctx: &'a TransferContext,
    _p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move { Ok(StepOutcome::Transition(Requesting)) })
}

fn provider_provisioned<'a>(
    _ctx: &'a TransferContext,
    _p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move { Ok(StepOutcome::Transition(Starting)) })
}

fn requesting<'a>(
    ctx: &'a TransferContext,
    p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move {
        // without an explicit destination, deliver into what was provisioned
        let destination = p.data_request.destination.clone().or_else(|| {
            p.live_resources()
                .find_map(|r| r.data_address.clone())
        });
        let body = MessageBody::TransferRequest {
            consumer_pid: p.pid(),
            agreement_id: p.data_request.agreement_id.clone(),
            asset_id: p.data_request.asset_id.clone(),
            transfer_type: p.data_request.transfer_type.clone(),
            data_destination: destination,
            callback_address: ctx.callback_address.clone(),
        };

        let ack = match ctx.send(p, body).await {
            Ok(ack) => ack,
            Err(e) => return Ok(e.outcome("TransferRequest")),
        };
        if p.correlation_id.is_none() {
            match ack.process_id {
                Some(pid) => p.correlation_id = Some(pid),
                None => return Ok(StepOutcome::fatal("provider did not return a process id")),
            }
        }
        Ok(StepOutcome::Transition(Requested))
    })
}

fn starting<'a>(
    ctx: &'a TransferContext,
    p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move {
        let Some((consumer_pid, provider_pid)) = p.pids() else {
            return Ok(StepOutcome::fatal("consumer process id unknown"));
        };
        let address = match ctx.data_flow.start(p).await {
            Ok(address) => address,
            Err(e) => return Ok(e.outcome()),
        };
        p.data_address = address.clone();

        let body = MessageBody::TransferStart {
            consumer_pid,
            provider_pid,
            data_address: address,
        };
        match ctx.send(p, body).await {
            Ok(_) => Ok(StepOutcome::Transition(Started)),
            Err(e) => Ok(e.outcome("TransferStart")),
        }
    })
}

fn suspending<'a>(
    ctx: &'a TransferContext,
    p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move {
        let Some((consumer_pid, provider_pid)) = p.pids() else {
            return Ok(StepOutcome::fatal("counterparty process id unknown"));
        };
        if p.role == Role::Provider
            && let Err(e) = ctx.data_flow.suspend(p.id()).await
        {
            return Ok(e.outcome());
        }
        let body = MessageBody::TransferSuspension {
            consumer_pid,
            provider_pid,
            reason: p.suspension_reason.clone(),
        };
        match ctx.send(p, body).await {
            Ok(_) => Ok(StepOutcome::Transition(Suspended)),
            Err(e) => Ok(e.outcome("TransferSuspension")),
        }
    })
}

/// Ask the provider to restart the flow
fn consumer_resuming<'a>(
    ctx: &'a TransferContext,
    p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move {
        let Some((consumer_pid, provider_pid)) = p.pids() else {
            return Ok(StepOutcome::fatal("provider process id unknown"));
        };
        let body = MessageBody::TransferStart {
            consumer_pid,
            provider_pid,
            data_address: None,
        };
        match ctx.send(p, body).await {
            Ok(_) => {
                p.suspension_reason = None;
                Ok(StepOutcome::Transition(Started))
            }
            Err(e) => Ok(e.outcome("TransferStart")),
        }
    })
}

fn provider_resuming<'a>(
    _ctx: &'a TransferContext,
    p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move {
        p.suspension_reason = None;
        Ok(StepOutcome::Transition(Starting))
    })
}

fn completing<'a>(
    ctx: &'a TransferContext,
    p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move {
        let Some((consumer_pid, provider_pid)) = p.pids() else {
            return Ok(StepOutcome::fatal("counterparty process id unknown"));
        };
        let body = MessageBody::TransferCompletion {
            consumer_pid,
            provider_pid,
        };
        match ctx.send(p, body).await {
            Ok(_) => Ok(StepOutcome::Transition(Deprovisioning)),
            Err(e) => Ok(e.outcome("TransferCompletion")),
        }
    })
}

fn terminating<'a>(
    ctx: &'a TransferContext,
    p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move {
        if p.role == Role::Provider
            && let Err(e) = ctx.data_flow.terminate(p.id()).await
        {
            return Ok(e.outcome());
        }

        if !p.counterparty_terminated
            && let Some((consumer_pid, provider_pid)) = p.pids()
        {
            let body = MessageBody::TransferTermination {
                consumer_pid,
                provider_pid,
                reason: p.termination_reason.clone(),
            };
            if let Err(e) = ctx.send(p, body).await {
                return Ok(e.outcome("TransferTermination"));
            }
        }

        if p.has_live_resources() {
            Ok(StepOutcome::Transition(Deprovisioning))
        } else {
            Ok(StepOutcome::Transition(Terminated))
        }
    })
}

/// Release every live resource and its secret
fn deprovisioning<'a>(
    ctx: &'a TransferContext,
    p: &'a mut TransferProcess,
) -> HandlerFuture<'a, TransferState> {
    Box::pin(async move {
        let id = p.id();
        if p.role == Role::Provider
            && let Err(e) = ctx.data_flow.terminate(id).await
        {
            return Ok(e.outcome());
        }

        let mut failures = Vec::new();
        for resource in p.provisioned_resources.iter_mut().filter(|r| !r.deprovisioned) {
            let Some(provisioner) = ctx.provisioners.for_resource(resource) else {
                return Ok(StepOutcome::fatal(format!(
                    "no provisioner can release resource {} of kind {}",
                    resource.id, resource.kind
                )));
            };
            match provisioner.deprovision(resource).await {
                DeprovisionResult::Deprovisioned => {}
                DeprovisionResult::Failed(message) => {
                    failures.push(format!("resource {}: {message}", resource.resource_definition_id));
                    continue;
                }
            }
            if let Some(key) = &resource.secret_key {
                match ctx.vault.delete_secret(key) {
                    Ok(()) | Err(VaultError::NotFound(_)) => {}
                    Err(e) => {
                        failures.push(format!("resource {}: {e}", resource.resource_definition_id));
                        continue;
                    }
                }
            }
            resource.deprovisioned = true;
            info!(transfer_id = %id, resource = %resource.id, "Resource deprovisioned");
        }

        if !failures.is_empty() {
            return Ok(StepOutcome::retry(failures.join("; ")));
        }
        if p.termination_reason.is_some() {
            Ok(StepOutcome::Transition(Terminated))
        } else {
            Ok(StepOutcome::Transition(Completed))
        }
    })
}

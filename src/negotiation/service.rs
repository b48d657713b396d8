//! Negotiation service: user commands and inbound protocol messages
//!
//! Everything here mutates through the [`CommandExecutor`], so a command or
//! an inbound message never races a manager handler on the same entity. A
//! message that arrives while the entity is leased fails with `Busy`, which
//! the sender sees as a retryable `Unavailable`.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::error::NegotiationError;
use super::state::NegotiationState::{self, *};
use super::types::{ContractAgreement, ContractNegotiation, ContractOffer, NegotiationParty};
use super::{graph_of, inherit_trace};
use crate::clock::Clock;
use crate::dispatcher::{DispatchAck, MessageBody, NegotiationEventType, Origin, RemoteMessage};
use crate::entity::{EntityId, ProcessState, Role, StatefulEntity};
use crate::events::{CallbackAddress, EventPublisher};
use crate::state_machine::{CommandError, CommandExecutor, StateGraph};
use crate::store::{Criterion, EntityStore, QuerySpec, StoreError};

/// Resolves agreements that other processes (transfers) depend on
#[async_trait]
pub trait AgreementLookup: Send + Sync {
    /// The agreement with `agreement_id`, if its negotiation is FINALIZED
    async fn finalized_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Option<ContractAgreement>, NegotiationError>;
}

pub struct NegotiationService {
    executor: CommandExecutor<ContractNegotiation>,
    participant_id: String,
}

impl NegotiationService {
    pub fn new(
        store: Arc<dyn EntityStore<ContractNegotiation>>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventPublisher>,
        participant_id: &str,
    ) -> Self {
        Self {
            executor: CommandExecutor::new(store, graph_of, clock, events, participant_id),
            participant_id: participant_id.to_string(),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Start a consumer negotiation for `offer`
    pub async fn initiate(
        &self,
        party: NegotiationParty,
        offer: ContractOffer,
        callbacks: Vec<CallbackAddress>,
    ) -> Result<EntityId, NegotiationError> {
        self.create(Role::Consumer, party, offer, callbacks).await
    }

    /// Start a provider negotiation by offering first
    pub async fn offer(
        &self,
        party: NegotiationParty,
        offer: ContractOffer,
        callbacks: Vec<CallbackAddress>,
    ) -> Result<EntityId, NegotiationError> {
        self.create(Role::Provider, party, offer, callbacks).await
    }

    async fn create(
        &self,
        role: Role,
        party: NegotiationParty,
        offer: ContractOffer,
        callbacks: Vec<CallbackAddress>,
    ) -> Result<EntityId, NegotiationError> {
        let mut negotiation =
            ContractNegotiation::new(role, Initial, party, offer, self.executor.now());
        negotiation.callback_addresses = callbacks;
        let id = self.executor.create(negotiation).await?;
        info!(negotiation_id = %id, role = %role, "Negotiation initiated");
        Ok(id)
    }

    /// Consumer accepts the provider's current offer
    pub async fn accept(&self, id: &EntityId) -> Result<(), NegotiationError> {
        self.executor
            .execute::<_, NegotiationError, _>(id, |n: &mut ContractNegotiation, graph, now| {
                require_role(n, Role::Consumer)?;
                graph.apply(n, Accepting, now)?;
                Ok(())
            })
            .await
    }

    /// Answer the counterparty's offer or request with a new offer
    pub async fn counter_offer(
        &self,
        id: &EntityId,
        offer: ContractOffer,
    ) -> Result<(), NegotiationError> {
        self.executor
            .execute::<_, NegotiationError, _>(id, |n: &mut ContractNegotiation, graph, now| {
                let next = match n.role {
                    Role::Consumer => Requesting,
                    Role::Provider => Offering,
                };
                graph.apply(n, next, now)?;
                n.contract_offers.push(offer);
                Ok(())
            })
            .await
    }

    /// Move to TERMINATING; the manager tells the counterparty
    pub async fn terminate(&self, id: &EntityId, reason: &str) -> Result<(), NegotiationError> {
        self.executor
            .execute::<_, NegotiationError, _>(id, |n: &mut ContractNegotiation, graph, now| {
                graph.apply(n, Terminating, now)?;
                n.meta.error_detail = Some(reason.to_string());
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, id: &EntityId) -> Result<(), NegotiationError> {
        self.executor.store().delete(id).await.map_err(store_error)
    }

    pub async fn find(&self, id: &EntityId) -> Result<Option<ContractNegotiation>, NegotiationError> {
        self.executor.store().find(id).await.map_err(store_error)
    }

    pub async fn query(&self, query: &QuerySpec) -> Result<Vec<ContractNegotiation>, NegotiationError> {
        self.executor.store().query(query).await.map_err(store_error)
    }

    // ========================================================================
    // Inbound protocol
    // ========================================================================

    /// Route an inbound negotiation message to its handler
    pub async fn receive(&self, message: RemoteMessage) -> Result<DispatchAck, NegotiationError> {
        let origin = message.origin();
        debug!(sender = %origin.sender_id, kind = message.body.name(), "Negotiation message received");

        match message.body.clone() {
            MessageBody::ContractRequest {
                consumer_pid,
                provider_pid,
                offer,
                callback_address,
            } => {
                self.on_request(&origin, &consumer_pid, provider_pid.as_deref(), offer, &callback_address)
                    .await
            }
            MessageBody::ContractOffer {
                provider_pid,
                consumer_pid,
                offer,
                callback_address,
            } => {
                self.on_offer(&origin, &provider_pid, consumer_pid.as_deref(), offer, &callback_address)
                    .await
            }
            MessageBody::NegotiationEvent {
                consumer_pid,
                provider_pid,
                event: NegotiationEventType::Accepted,
            } => self.on_accepted(&origin, &consumer_pid, &provider_pid).await,
            MessageBody::NegotiationEvent {
                consumer_pid,
                provider_pid,
                event: NegotiationEventType::Finalized,
            } => self.on_finalized(&origin, &consumer_pid, &provider_pid).await,
            MessageBody::ContractAgreement {
                consumer_pid,
                provider_pid,
                agreement,
            } => self.on_agreement(&origin, &consumer_pid, &provider_pid, agreement).await,
            MessageBody::AgreementVerification {
                consumer_pid,
                provider_pid,
            } => self.on_verification(&origin, &consumer_pid, &provider_pid).await,
            MessageBody::NegotiationTermination {
                consumer_pid,
                provider_pid,
                reason,
            } => {
                self.on_termination(&origin, &consumer_pid, &provider_pid, reason)
                    .await
            }
            other => Err(NegotiationError::InvalidMessage(format!(
                "{} is not a negotiation message",
                other.name()
            ))),
        }
    }

    /// Provider side of a contract request: new negotiation, or the consumer's
    /// answer to our offer
    pub async fn on_request(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        provider_pid: Option<&str>,
        offer: ContractOffer,
        callback_address: &str,
    ) -> Result<DispatchAck, NegotiationError> {
        if let Some(pid) = provider_pid {
            let id = parse_pid(pid)?;
            self.executor
                .execute::<_, NegotiationError, _>(&id, |n: &mut ContractNegotiation, graph, now| {
                    check_peer(n, Role::Provider, origin.sender_id, consumer_pid)?;
                    if n.state() != Some(Requested) {
                        graph.apply(n, Requested, now)?;
                        n.contract_offers.push(offer);
                    }
                    Ok(())
                })
                .await?;
            return Ok(DispatchAck::created(pid));
        }

        // redelivered request: answer with the process already created
        if let Some(existing) = self
            .by_correlation(Role::Provider, origin.sender_id, consumer_pid)
            .await?
        {
            return Ok(DispatchAck::created(existing.pid()));
        }

        let party = NegotiationParty {
            counterparty_id: origin.sender_id.to_string(),
            counterparty_address: callback_address.to_string(),
            protocol: origin.protocol.to_string(),
        };
        let mut negotiation =
            ContractNegotiation::new(Role::Provider, Requested, party, offer, self.executor.now());
        negotiation.correlation_id = Some(consumer_pid.to_string());
        inherit_trace(&mut negotiation, origin.trace_context);
        let id = self.executor.create(negotiation).await?;
        info!(negotiation_id = %id, consumer = %origin.sender_id, "Contract request accepted for evaluation");
        Ok(DispatchAck::created(id.to_string()))
    }

    /// Consumer side of a contract offer: new negotiation, or the provider's
    /// counter-offer to our request
    pub async fn on_offer(
        &self,
        origin: &Origin<'_>,
        provider_pid: &str,
        consumer_pid: Option<&str>,
        offer: ContractOffer,
        callback_address: &str,
    ) -> Result<DispatchAck, NegotiationError> {
        if let Some(pid) = consumer_pid {
            let id = parse_pid(pid)?;
            self.executor
                .execute::<_, NegotiationError, _>(&id, |n: &mut ContractNegotiation, graph, now| {
                    check_peer(n, Role::Consumer, origin.sender_id, provider_pid)?;
                    if n.state() != Some(Offered) {
                        graph.apply(n, Offered, now)?;
                        n.contract_offers.push(offer);
                    }
                    Ok(())
                })
                .await?;
            return Ok(DispatchAck::created(pid));
        }

        if let Some(existing) = self
            .by_correlation(Role::Consumer, origin.sender_id, provider_pid)
            .await?
        {
            return Ok(DispatchAck::created(existing.pid()));
        }

        let party = NegotiationParty {
            counterparty_id: origin.sender_id.to_string(),
            counterparty_address: callback_address.to_string(),
            protocol: origin.protocol.to_string(),
        };
        let mut negotiation =
            ContractNegotiation::new(Role::Consumer, Offered, party, offer, self.executor.now());
        negotiation.correlation_id = Some(provider_pid.to_string());
        inherit_trace(&mut negotiation, origin.trace_context);
        let id = self.executor.create(negotiation).await?;
        info!(negotiation_id = %id, provider = %origin.sender_id, "Contract offer received");
        Ok(DispatchAck::created(id.to_string()))
    }

    pub async fn on_accepted(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        provider_pid: &str,
    ) -> Result<DispatchAck, NegotiationError> {
        self.advance(origin, Role::Provider, provider_pid, consumer_pid, Accepted)
            .await
    }

    pub async fn on_agreement(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        provider_pid: &str,
        agreement: ContractAgreement,
    ) -> Result<DispatchAck, NegotiationError> {
        let id = parse_pid(consumer_pid)?;
        self.executor
            .execute::<_, NegotiationError, _>(&id, |n: &mut ContractNegotiation, graph, now| {
                check_peer(n, Role::Consumer, origin.sender_id, provider_pid)?;
                // the provider resends until acknowledged; a known agreement is a no-op
                if n.agreement().is_some_and(|a| a.id == agreement.id) {
                    return Ok(());
                }
                n.attach_agreement(agreement)
                    .map_err(NegotiationError::AgreementConflict)?;
                graph.apply(n, Agreed, now)?;
                Ok(())
            })
            .await?;
        Ok(DispatchAck::empty())
    }

    pub async fn on_verification(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        provider_pid: &str,
    ) -> Result<DispatchAck, NegotiationError> {
        self.advance(origin, Role::Provider, provider_pid, consumer_pid, Verified)
            .await
    }

    pub async fn on_finalized(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        provider_pid: &str,
    ) -> Result<DispatchAck, NegotiationError> {
        self.advance(origin, Role::Consumer, consumer_pid, provider_pid, Finalized)
            .await
    }

    /// Counterparty ended the negotiation; a FINALIZED one stays in force
    pub async fn on_termination(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        provider_pid: &str,
        reason: Option<String>,
    ) -> Result<DispatchAck, NegotiationError> {
        let (id, role, counterpart) = self.resolve_own(consumer_pid, provider_pid).await?;
        self.executor
            .execute::<_, NegotiationError, _>(&id, |n: &mut ContractNegotiation, graph, now| {
                check_peer(n, role, origin.sender_id, counterpart)?;
                match n.state() {
                    Some(Terminated) => return Ok(()),
                    Some(Finalized) => {
                        return Err(NegotiationError::InvalidMessage(
                            "negotiation is finalized and cannot be terminated".into(),
                        ));
                    }
                    _ => {}
                }
                graph.apply(n, Terminated, now)?;
                n.meta.error_detail =
                    Some(reason.unwrap_or_else(|| "terminated by counterparty".to_string()));
                Ok(())
            })
            .await?;
        info!(negotiation_id = %id, counterparty = %origin.sender_id, "Negotiation terminated by counterparty");
        Ok(DispatchAck::empty())
    }

    /// Move the own process `own_pid` to `next`; already there is a no-op
    async fn advance(
        &self,
        origin: &Origin<'_>,
        role: Role,
        own_pid: &str,
        counterpart_pid: &str,
        next: NegotiationState,
    ) -> Result<DispatchAck, NegotiationError> {
        let id = parse_pid(own_pid)?;
        self.executor
            .execute::<_, NegotiationError, _>(&id, |n: &mut ContractNegotiation, graph: &StateGraph<NegotiationState>, now| {
                check_peer(n, role, origin.sender_id, counterpart_pid)?;
                if n.state() != Some(next) {
                    graph.apply(n, next, now)?;
                }
                Ok(())
            })
            .await?;
        Ok(DispatchAck::empty())
    }

    async fn by_correlation(
        &self,
        role: Role,
        counterparty_id: &str,
        correlation_id: &str,
    ) -> Result<Option<ContractNegotiation>, NegotiationError> {
        let query = QuerySpec::filtered(vec![
            Criterion::equal("role", role.as_str()),
            Criterion::equal("counterpartyId", counterparty_id),
            Criterion::equal("correlationId", correlation_id),
        ]);
        Ok(self.query(&query).await?.into_iter().next())
    }

    /// Which of the two pids names a process of ours
    async fn resolve_own<'p>(
        &self,
        consumer_pid: &'p str,
        provider_pid: &'p str,
    ) -> Result<(EntityId, Role, &'p str), NegotiationError> {
        for (own, role, counterpart) in [
            (consumer_pid, Role::Consumer, provider_pid),
            (provider_pid, Role::Provider, consumer_pid),
        ] {
            let Ok(id) = own.parse::<EntityId>() else {
                continue;
            };
            if let Some(n) = self.find(&id).await?
                && n.role == role
            {
                return Ok((id, role, counterpart));
            }
        }
        Err(NegotiationError::NotFound(format!(
            "consumer {consumer_pid} / provider {provider_pid}"
        )))
    }
}

#[async_trait]
impl AgreementLookup for NegotiationService {
    async fn finalized_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Option<ContractAgreement>, NegotiationError> {
        let query = QuerySpec::filtered(vec![
            Criterion::equal("agreement.id", agreement_id),
            Criterion::equal("state", Finalized.code()),
        ]);
        Ok(self
            .query(&query)
            .await?
            .into_iter()
            .find_map(|n| n.agreement().cloned()))
    }
}

fn parse_pid(pid: &str) -> Result<EntityId, NegotiationError> {
    pid.parse()
        .map_err(|_| NegotiationError::InvalidMessage(format!("malformed process id {pid}")))
}

fn require_role(n: &ContractNegotiation, role: Role) -> Result<(), NegotiationError> {
    if n.role != role {
        return Err(NegotiationError::WrongRole(n.role.to_string()));
    }
    Ok(())
}

/// The message must come from our counterparty and name its process
fn check_peer(
    n: &mut ContractNegotiation,
    role: Role,
    sender_id: &str,
    counterpart_pid: &str,
) -> Result<(), NegotiationError> {
    require_role(n, role)?;
    if n.counterparty_id != sender_id {
        return Err(NegotiationError::CounterpartyMismatch {
            expected: n.counterparty_id.clone(),
            actual: sender_id.to_string(),
        });
    }
    match &n.correlation_id {
        Some(known) if known != counterpart_pid => Err(NegotiationError::InvalidMessage(format!(
            "unknown counterparty process {counterpart_pid}"
        ))),
        Some(_) => Ok(()),
        None => {
            n.correlation_id = Some(counterpart_pid.to_string());
            Ok(())
        }
    }
}

fn store_error(e: StoreError) -> NegotiationError {
    CommandError::from(e).into()
}

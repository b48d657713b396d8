//! Transfer service: user commands, provisioner callbacks and inbound
//! protocol messages, all through the lease-respecting executor

use std::sync::Arc;
use tracing::{debug, info};

use super::error::TransferError;
use super::state::{TransferState::{self, *}, transfer_graph};
use super::types::{DataAddress, DataRequest, ProvisionedResource, ResourceDefinition, TransferProcess};
use super::handlers::secret_key;
use crate::clock::Clock;
use crate::dispatcher::{DispatchAck, MessageBody, Origin, RemoteMessage};
use crate::entity::{EntityId, Role, StatefulEntity};
use crate::events::{CallbackAddress, EventPublisher};
use crate::negotiation::AgreementLookup;
use crate::state_machine::{CommandError, CommandExecutor, StateGraph};
use crate::store::{Criterion, EntityStore, QuerySpec, StoreError};
use crate::vault::Vault;

fn graph_of(_process: &TransferProcess) -> Arc<StateGraph<TransferState>> {
    transfer_graph()
}

pub struct TransferService {
    executor: CommandExecutor<TransferProcess>,
    agreements: Arc<dyn AgreementLookup>,
    vault: Arc<dyn Vault>,
}

impl TransferService {
    pub fn new(
        store: Arc<dyn EntityStore<TransferProcess>>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventPublisher>,
        agreements: Arc<dyn AgreementLookup>,
        vault: Arc<dyn Vault>,
        participant_id: &str,
    ) -> Self {
        Self {
            executor: CommandExecutor::new(store, graph_of, clock, events, participant_id),
            agreements,
            vault,
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Start a consumer transfer under a finalized agreement
    pub async fn initiate(
        &self,
        request: DataRequest,
        manifest: Vec<ResourceDefinition>,
        callbacks: Vec<CallbackAddress>,
    ) -> Result<EntityId, TransferError> {
        let mut process =
            TransferProcess::new(Role::Consumer, request, manifest, self.executor.now());
        process.callback_addresses = callbacks;
        let id = self.executor.create(process).await?;
        info!(transfer_id = %id, "Transfer initiated");
        Ok(id)
    }

    pub async fn complete(&self, id: &EntityId) -> Result<(), TransferError> {
        self.executor
            .execute::<_, TransferError, _>(id, |p: &mut TransferProcess, graph, now| {
                graph.apply(p, Completing, now)?;
                Ok(())
            })
            .await
    }

    pub async fn suspend(&self, id: &EntityId, reason: &str) -> Result<(), TransferError> {
        self.executor
            .execute::<_, TransferError, _>(id, |p: &mut TransferProcess, graph, now| {
                graph.apply(p, Suspending, now)?;
                p.suspension_reason = Some(reason.to_string());
                Ok(())
            })
            .await
    }

    pub async fn resume(&self, id: &EntityId) -> Result<(), TransferError> {
        self.executor
            .execute::<_, TransferError, _>(id, |p: &mut TransferProcess, graph, now| {
                graph.apply(p, Resuming, now)?;
                Ok(())
            })
            .await
    }

    pub async fn terminate(&self, id: &EntityId, reason: &str) -> Result<(), TransferError> {
        self.executor
            .execute::<_, TransferError, _>(id, |p: &mut TransferProcess, graph, now| {
                graph.apply(p, Terminating, now)?;
                p.termination_reason = Some(reason.to_string());
                Ok(())
            })
            .await
    }

    /// Completion callback of an asynchronous provisioner
    ///
    /// Moves PROVISIONING_REQUESTED to PROVISIONED once every mandatory entry
    /// is provisioned; returns whether it did.
    pub async fn notify_provisioned(
        &self,
        id: &EntityId,
        mut resource: ProvisionedResource,
        secret: Option<String>,
    ) -> Result<bool, TransferError> {
        let vault = &self.vault;
        self.executor
            .execute::<_, TransferError, _>(id, |p: &mut TransferProcess, graph, now| {
                let state = graph.state_of(p)?;
                if state.is_terminal() {
                    return Err(TransferError::InvalidMessage(format!(
                        "transfer {} is {state}",
                        p.id()
                    )));
                }
                let definition = &resource.resource_definition_id;
                if !p.resource_manifest.iter().any(|d| &d.id == definition) {
                    return Err(TransferError::UnknownResource(definition.clone()));
                }
                if let Some(secret) = secret {
                    let key = secret_key(p.id(), definition);
                    vault.store_secret(&key, &secret)?;
                    resource.secret_key = Some(key);
                }
                p.add_provisioned(resource);

                if state == ProvisioningRequested && p.mandatory_provisioned() {
                    graph.apply(p, Provisioned, now)?;
                    return Ok(true);
                }
                Ok(false)
            })
            .await
    }

    pub async fn delete(&self, id: &EntityId) -> Result<(), TransferError> {
        self.executor.store().delete(id).await.map_err(store_error)
    }

    pub async fn find(&self, id: &EntityId) -> Result<Option<TransferProcess>, TransferError> {
        self.executor.store().find(id).await.map_err(store_error)
    }

    pub async fn query(&self, query: &QuerySpec) -> Result<Vec<TransferProcess>, TransferError> {
        self.executor.store().query(query).await.map_err(store_error)
    }

    // ========================================================================
    // Inbound protocol
    // ========================================================================

    pub async fn receive(&self, message: RemoteMessage) -> Result<DispatchAck, TransferError> {
        let origin = message.origin();
        debug!(sender = %origin.sender_id, kind = message.body.name(), "Transfer message received");

        match message.body.clone() {
            MessageBody::TransferRequest {
                consumer_pid,
                agreement_id,
                asset_id,
                transfer_type,
                data_destination,
                callback_address,
            } => {
                let request = DataRequest {
                    agreement_id,
                    asset_id,
                    protocol: origin.protocol.to_string(),
                    counterparty_id: origin.sender_id.to_string(),
                    counterparty_address: callback_address,
                    transfer_type,
                    destination: data_destination,
                };
                self.on_request(&origin, &consumer_pid, request).await
            }
            MessageBody::TransferStart {
                consumer_pid,
                provider_pid,
                data_address,
            } => {
                self.on_start(&origin, &consumer_pid, &provider_pid, data_address)
                    .await
            }
            MessageBody::TransferSuspension {
                consumer_pid,
                provider_pid,
                reason,
            } => {
                self.on_suspension(&origin, &consumer_pid, &provider_pid, reason)
                    .await
            }
            MessageBody::TransferCompletion {
                consumer_pid,
                provider_pid,
            } => self.on_completion(&origin, &consumer_pid, &provider_pid).await,
            MessageBody::TransferTermination {
                consumer_pid,
                provider_pid,
                reason,
            } => {
                self.on_termination(&origin, &consumer_pid, &provider_pid, reason)
                    .await
            }
            other => Err(TransferError::InvalidMessage(format!(
                "{} is not a transfer message",
                other.name()
            ))),
        }
    }

    /// Provider side of a transfer request
    ///
    /// The agreement must be finalized here and issued to the requester.
    pub async fn on_request(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        request: DataRequest,
    ) -> Result<DispatchAck, TransferError> {
        if let Some(existing) = self
            .by_correlation(origin.sender_id, consumer_pid)
            .await?
        {
            return Ok(DispatchAck::created(existing.pid()));
        }

        let agreement = self
            .agreements
            .finalized_agreement(&request.agreement_id)
            .await?
            .ok_or_else(|| TransferError::AgreementNotFound(request.agreement_id.clone()))?;
        if agreement.consumer_id != origin.sender_id {
            return Err(TransferError::CounterpartyMismatch {
                expected: agreement.consumer_id,
                actual: origin.sender_id.to_string(),
            });
        }
        if agreement.asset_id != request.asset_id {
            return Err(TransferError::InvalidMessage(format!(
                "agreement {} covers asset {}, not {}",
                agreement.id, agreement.asset_id, request.asset_id
            )));
        }

        let mut process =
            TransferProcess::new(Role::Provider, request, Vec::new(), self.executor.now());
        process.correlation_id = Some(consumer_pid.to_string());
        process
            .meta
            .trace_context
            .extend(origin.trace_context.iter().map(|(k, v)| (k.clone(), v.clone())));
        let id = self.executor.create(process).await?;
        info!(transfer_id = %id, consumer = %origin.sender_id, "Transfer request accepted");
        Ok(DispatchAck::created(id.to_string()))
    }

    /// Consumer: the flow is running. Provider: the consumer wants it resumed.
    pub async fn on_start(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        provider_pid: &str,
        data_address: Option<DataAddress>,
    ) -> Result<DispatchAck, TransferError> {
        let (id, role, counterpart) = self.resolve_own(consumer_pid, provider_pid).await?;
        self.executor
            .execute::<_, TransferError, _>(&id, |p: &mut TransferProcess, graph, now| {
                check_peer(p, role, origin.sender_id, counterpart)?;
                let state = graph.state_of(p)?;
                match role {
                    Role::Consumer => {
                        if state != Started {
                            graph.apply(p, Started, now)?;
                        }
                        if data_address.is_some() {
                            p.data_address = data_address;
                        }
                    }
                    Role::Provider => {
                        if !matches!(state, Starting | Started) {
                            graph.apply(p, Starting, now)?;
                        }
                    }
                }
                Ok(())
            })
            .await?;
        Ok(DispatchAck::empty())
    }

    pub async fn on_suspension(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        provider_pid: &str,
        reason: Option<String>,
    ) -> Result<DispatchAck, TransferError> {
        let (id, role, counterpart) = self.resolve_own(consumer_pid, provider_pid).await?;
        self.executor
            .execute::<_, TransferError, _>(&id, |p: &mut TransferProcess, graph, now| {
                check_peer(p, role, origin.sender_id, counterpart)?;
                if graph.state_of(p)? != Suspended {
                    graph.apply(p, Suspended, now)?;
                }
                p.suspension_reason = reason;
                Ok(())
            })
            .await?;
        Ok(DispatchAck::empty())
    }

    pub async fn on_completion(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        provider_pid: &str,
    ) -> Result<DispatchAck, TransferError> {
        let (id, role, counterpart) = self.resolve_own(consumer_pid, provider_pid).await?;
        self.executor
            .execute::<_, TransferError, _>(&id, |p: &mut TransferProcess, graph, now| {
                check_peer(p, role, origin.sender_id, counterpart)?;
                if !matches!(graph.state_of(p)?, Deprovisioning | Completed) {
                    graph.apply(p, Deprovisioning, now)?;
                }
                Ok(())
            })
            .await?;
        Ok(DispatchAck::empty())
    }

    /// Counterparty ended the transfer; resources are still released here
    pub async fn on_termination(
        &self,
        origin: &Origin<'_>,
        consumer_pid: &str,
        provider_pid: &str,
        reason: Option<String>,
    ) -> Result<DispatchAck, TransferError> {
        let (id, role, counterpart) = self.resolve_own(consumer_pid, provider_pid).await?;
        self.executor
            .execute::<_, TransferError, _>(&id, |p: &mut TransferProcess, graph, now| {
                check_peer(p, role, origin.sender_id, counterpart)?;
                match graph.state_of(p)? {
                    Terminated => return Ok(()),
                    Completed => {
                        return Err(TransferError::InvalidMessage(
                            "transfer already completed".into(),
                        ));
                    }
                    Terminating => {}
                    _ => graph.apply(p, Terminating, now).map(|_| ())?,
                }
                p.counterparty_terminated = true;
                p.termination_reason =
                    Some(reason.unwrap_or_else(|| "terminated by counterparty".to_string()));
                Ok(())
            })
            .await?;
        info!(transfer_id = %id, counterparty = %origin.sender_id, "Transfer terminated by counterparty");
        Ok(DispatchAck::empty())
    }

    async fn by_correlation(
        &self,
        counterparty_id: &str,
        correlation_id: &str,
    ) -> Result<Option<TransferProcess>, TransferError> {
        let query = QuerySpec::filtered(vec![
            Criterion::equal("role", Role::Provider.as_str()),
            Criterion::equal("dataRequest.counterpartyId", counterparty_id),
            Criterion::equal("correlationId", correlation_id),
        ]);
        Ok(self.query(&query).await?.into_iter().next())
    }

    async fn resolve_own<'p>(
        &self,
        consumer_pid: &'p str,
        provider_pid: &'p str,
    ) -> Result<(EntityId, Role, &'p str), TransferError> {
        for (own, role, counterpart) in [
            (consumer_pid, Role::Consumer, provider_pid),
            (provider_pid, Role::Provider, consumer_pid),
        ] {
            let Ok(id) = own.parse::<EntityId>() else {
                continue;
            };
            if let Some(p) = self.find(&id).await?
                && p.role == role
            {
                return Ok((id, role, counterpart));
            }
        }
        Err(TransferError::NotFound(format!(
            "consumer {consumer_pid} / provider {provider_pid}"
        )))
    }
}

fn check_peer(
    p: &mut TransferProcess,
    role: Role,
    sender_id: &str,
    counterpart_pid: &str,
) -> Result<(), TransferError> {
    if p.role != role {
        return Err(TransferError::WrongRole(p.role.to_string()));
    }
    if p.data_request.counterparty_id != sender_id {
        return Err(TransferError::CounterpartyMismatch {
            expected: p.data_request.counterparty_id.clone(),
            actual: sender_id.to_string(),
        });
    }
    match &p.correlation_id {
        Some(known) if known != counterpart_pid => Err(TransferError::InvalidMessage(format!(
            "unknown counterparty process {counterpart_pid}"
        ))),
        Some(_) => Ok(()),
        None => {
            p.correlation_id = Some(counterpart_pid.to_string());
            Ok(())
        }
    }
}

fn store_error(e: StoreError) -> TransferError {
    CommandError::from(e).into()
}

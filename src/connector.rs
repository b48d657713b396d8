//! Connector: one participant's services and managers wired together
//!
//! A connector owns the negotiation and transfer services and runs four
//! managers (consumer and provider role of each process type) over the
//! injected stores. It is also the participant's [`ProtocolReceiver`]:
//! inbound messages are routed to the service owning the message type, and
//! service errors become the protocol answer.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::dispatcher::{DispatchAck, DispatchError, DispatcherRegistry, ProtocolReceiver, RemoteMessage};
use crate::events::{EventPublisher, NoopEventPublisher};
use crate::negotiation::{
    self, AgreementLookup, ContractNegotiation, NegotiationContext, NegotiationService,
    NegotiationState,
};
use crate::policy::{PermitAll, PolicyEvaluator};
use crate::state_machine::{EngineError, ManagerConfig, StateMachineManager, TickReport};
use crate::store::{EntityStore, InMemoryEntityStore};
use crate::transfer::{
    DataFlowController, InProcessDataFlow, ProvisionerRegistry, TransferContext, TransferProcess,
    TransferService, TransferState, handlers,
};
use crate::vault::{InMemoryVault, Vault};

/// Identity and loop settings of one participant
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub participant_id: String,
    pub address: String,
    pub negotiation: ManagerConfig,
    pub transfer: ManagerConfig,
}

impl ConnectorSettings {
    pub fn new(participant_id: &str, address: &str) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            address: address.to_string(),
            negotiation: ManagerConfig::default(),
            transfer: ManagerConfig::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            participant_id: config.participant_id.clone(),
            address: config.address.clone(),
            negotiation: ManagerConfig::from(&config.negotiation),
            transfer: ManagerConfig::from(&config.transfer),
        }
    }
}

/// Stores and collaborators injected into a connector
#[derive(Clone)]
pub struct ConnectorDeps {
    pub negotiations: Arc<dyn EntityStore<ContractNegotiation>>,
    pub transfers: Arc<dyn EntityStore<TransferProcess>>,
    pub dispatcher: Arc<DispatcherRegistry>,
    pub policy: Arc<dyn PolicyEvaluator>,
    pub vault: Arc<dyn Vault>,
    pub provisioners: Arc<ProvisionerRegistry>,
    pub data_flow: Arc<dyn DataFlowController>,
    pub events: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
}

impl ConnectorDeps {
    /// In-memory stores, vault and data flow; permit-all policy; no
    /// provisioners
    pub fn in_memory(dispatcher: Arc<DispatcherRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            negotiations: Arc::new(InMemoryEntityStore::with_clock(clock.clone())),
            transfers: Arc::new(InMemoryEntityStore::with_clock(clock.clone())),
            dispatcher,
            policy: Arc::new(PermitAll),
            vault: Arc::new(InMemoryVault::new()),
            provisioners: Arc::new(ProvisionerRegistry::new()),
            data_flow: Arc::new(InProcessDataFlow::new()),
            events: Arc::new(NoopEventPublisher),
            clock,
        }
    }

    pub fn with_system_clock(dispatcher: Arc<DispatcherRegistry>) -> Self {
        Self::in_memory(dispatcher, Arc::new(SystemClock))
    }
}

/// Merged reports of both roles of each process type
#[derive(Debug, Default)]
pub struct ConnectorTick {
    pub negotiation: TickReport<NegotiationState>,
    pub transfer: TickReport<TransferState>,
}

impl ConnectorTick {
    /// Entities claimed across all four managers
    pub fn claimed(&self) -> usize {
        self.negotiation.claimed() + self.transfer.claimed()
    }

    pub fn is_idle(&self) -> bool {
        self.claimed() == 0
    }
}

pub struct Connector {
    participant_id: String,
    address: String,
    negotiations: Arc<NegotiationService>,
    transfers: Arc<TransferService>,
    negotiation_consumer: Arc<StateMachineManager<ContractNegotiation>>,
    negotiation_provider: Arc<StateMachineManager<ContractNegotiation>>,
    transfer_consumer: Arc<StateMachineManager<TransferProcess>>,
    transfer_provider: Arc<StateMachineManager<TransferProcess>>,
}

impl Connector {
    pub fn new(settings: ConnectorSettings, deps: ConnectorDeps) -> Result<Arc<Self>, EngineError> {
        let participant = settings.participant_id.as_str();

        let negotiations = Arc::new(NegotiationService::new(
            deps.negotiations.clone(),
            deps.clock.clone(),
            deps.events.clone(),
            participant,
        ));
        let agreements: Arc<dyn AgreementLookup> = negotiations.clone();
        let transfers = Arc::new(TransferService::new(
            deps.transfers.clone(),
            deps.clock.clone(),
            deps.events.clone(),
            agreements.clone(),
            deps.vault.clone(),
            participant,
        ));

        let negotiation_ctx = Arc::new(NegotiationContext {
            participant_id: settings.participant_id.clone(),
            callback_address: settings.address.clone(),
            dispatcher: deps.dispatcher.clone(),
            policy: deps.policy.clone(),
            clock: deps.clock.clone(),
        });
        let transfer_ctx = Arc::new(TransferContext {
            participant_id: settings.participant_id.clone(),
            callback_address: settings.address.clone(),
            dispatcher: deps.dispatcher.clone(),
            agreements,
            policy: deps.policy.clone(),
            provisioners: deps.provisioners.clone(),
            data_flow: deps.data_flow.clone(),
            vault: deps.vault.clone(),
            clock: deps.clock.clone(),
        });

        let negotiation_consumer = StateMachineManager::new(
            negotiation::consumer::machine(negotiation_ctx.clone())?,
            deps.negotiations.clone(),
            settings.negotiation.clone(),
            participant,
        )
        .with_clock(deps.clock.clone())
        .with_events(deps.events.clone());
        let negotiation_provider = StateMachineManager::new(
            negotiation::provider::machine(negotiation_ctx)?,
            deps.negotiations.clone(),
            settings.negotiation.clone(),
            participant,
        )
        .with_clock(deps.clock.clone())
        .with_events(deps.events.clone());
        let transfer_consumer = StateMachineManager::new(
            handlers::consumer_machine(transfer_ctx.clone())?,
            deps.transfers.clone(),
            settings.transfer.clone(),
            participant,
        )
        .with_clock(deps.clock.clone())
        .with_events(deps.events.clone());
        let transfer_provider = StateMachineManager::new(
            handlers::provider_machine(transfer_ctx)?,
            deps.transfers,
            settings.transfer,
            participant,
        )
        .with_clock(deps.clock)
        .with_events(deps.events);

        Ok(Arc::new(Self {
            participant_id: settings.participant_id,
            address: settings.address,
            negotiations,
            transfers,
            negotiation_consumer: Arc::new(negotiation_consumer),
            negotiation_provider: Arc::new(negotiation_provider),
            transfer_consumer: Arc::new(transfer_consumer),
            transfer_provider: Arc::new(transfer_provider),
        }))
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn negotiations(&self) -> &Arc<NegotiationService> {
        &self.negotiations
    }

    pub fn transfers(&self) -> &Arc<TransferService> {
        &self.transfers
    }

    /// Spawn the four polling loops
    pub fn start(&self) {
        self.negotiation_consumer.start();
        self.negotiation_provider.start();
        self.transfer_consumer.start();
        self.transfer_provider.start();
        info!(participant = %self.participant_id, address = %self.address, "Connector started");
    }

    /// Stop the loops, waiting for in-flight ticks
    pub async fn stop(&self) {
        self.negotiation_consumer.stop().await;
        self.negotiation_provider.stop().await;
        self.transfer_consumer.stop().await;
        self.transfer_provider.stop().await;
        info!(participant = %self.participant_id, "Connector stopped");
    }

    pub fn is_running(&self) -> bool {
        self.negotiation_consumer.is_running()
            || self.negotiation_provider.is_running()
            || self.transfer_consumer.is_running()
            || self.transfer_provider.is_running()
    }

    /// One iteration of every manager, for callers driving time themselves
    pub async fn tick(&self) -> ConnectorTick {
        let mut negotiation = self.negotiation_consumer.tick().await;
        negotiation
            .steps
            .extend(self.negotiation_provider.tick().await.steps);
        let mut transfer = self.transfer_consumer.tick().await;
        transfer.steps.extend(self.transfer_provider.tick().await.steps);
        ConnectorTick {
            negotiation,
            transfer,
        }
    }
}

#[async_trait]
impl ProtocolReceiver for Connector {
    async fn receive(&self, message: RemoteMessage) -> Result<DispatchAck, DispatchError> {
        let kind = message.body.name();
        let sender = message.sender_id.clone();
        let result = if message.body.is_negotiation() {
            self.negotiations
                .receive(message)
                .await
                .map_err(|e| (e.code(), e.to_dispatch()))
        } else {
            self.transfers
                .receive(message)
                .await
                .map_err(|e| (e.code(), e.to_dispatch()))
        };
        result.map_err(|(code, e)| {
            warn!(
                participant = %self.participant_id,
                sender = %sender,
                kind,
                code,
                error = %e,
                "Inbound message refused"
            );
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatcher::{LoopbackDispatcher, MessageBody};
    use crate::events::CallbackAddress;
    use crate::negotiation::{ContractOffer, NegotiationParty};
    use crate::entity::StatefulEntity;
    use crate::policy::Policy;

    const PROTOCOL: &str = "dsp";

    fn pair() -> (Arc<Connector>, Arc<Connector>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let loopback = Arc::new(LoopbackDispatcher::new(PROTOCOL));
        let dispatcher = Arc::new(DispatcherRegistry::new().with(loopback.clone()));

        let consumer = Connector::new(
            ConnectorSettings::new("consumer", "mem://consumer"),
            ConnectorDeps::in_memory(dispatcher.clone(), clock.clone()),
        )
        .unwrap();
        let provider = Connector::new(
            ConnectorSettings::new("provider", "mem://provider"),
            ConnectorDeps::in_memory(dispatcher, clock),
        )
        .unwrap();
        let c: Arc<dyn ProtocolReceiver> = consumer.clone();
        let p: Arc<dyn ProtocolReceiver> = provider.clone();
        loopback.register("mem://consumer", &c);
        loopback.register("mem://provider", &p);
        (consumer, provider)
    }

    #[tokio::test]
    async fn test_request_routed_to_negotiation_service() {
        let (consumer, provider) = pair();
        let party = NegotiationParty {
            counterparty_id: "provider".into(),
            counterparty_address: "mem://provider".into(),
            protocol: PROTOCOL.into(),
        };
        let offer = ContractOffer::new("asset-1", Policy::permit_use("asset-1", "provider"));
        let id = consumer
            .negotiations()
            .initiate(party, offer, Vec::<CallbackAddress>::new())
            .await
            .unwrap();

        // INITIAL -> REQUESTING -> REQUESTED; the request reaches the provider
        let report = consumer.tick().await;
        assert!(report.negotiation.claimed() >= 1);
        assert_eq!(report.transfer.claimed(), 0);
        while !consumer.tick().await.is_idle() {}

        let sent = consumer.negotiations().find(&id).await.unwrap().unwrap();
        assert_eq!(sent.state(), Some(NegotiationState::Requested));
        let provider_side = provider.negotiations().query(&Default::default()).await.unwrap();
        assert_eq!(provider_side.len(), 1);
        assert_eq!(provider_side[0].state(), Some(NegotiationState::Requested));
        assert_eq!(sent.correlation_id, Some(provider_side[0].meta.id.to_string()));
    }

    #[tokio::test]
    async fn test_unknown_transfer_is_rejected() {
        let (_, provider) = pair();
        let message = RemoteMessage {
            protocol: PROTOCOL.into(),
            counterparty_address: "mem://provider".into(),
            sender_id: "consumer".into(),
            trace_context: Default::default(),
            body: MessageBody::TransferCompletion {
                consumer_pid: "c-1".into(),
                provider_pid: "01J00000000000000000000000".into(),
            },
        };
        let err = provider.receive(message).await.unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (consumer, _) = pair();
        assert!(!consumer.is_running());
        consumer.start();
        assert!(consumer.is_running());
        consumer.stop().await;
        assert!(!consumer.is_running());
    }
}

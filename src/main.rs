//! Dataspace connector demo
//!
//! Runs two participants in one process, wired by the loopback dispatcher:
//!
//! ```text
//! ┌────────────┐  ContractRequest / TransferRequest  ┌────────────┐
//! │  consumer  │────────────────────────────────────▶│  provider  │
//! │ (config)   │◀────────────────────────────────────│            │
//! └────────────┘  ContractAgreement / TransferStart  └────────────┘
//! ```
//!
//! The consumer negotiates a contract for one asset, transfers it under the
//! agreement, completes the transfer and both sides shut down.
//!
//! Usage: `connector [--env <name>]` reads `config/<name>.yaml` (default
//! `dev`).

use anyhow::{Context, bail};
use sqlx::postgres::PgPoolOptions;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use dataspace_connector::config::AppConfig;
use dataspace_connector::connector::{Connector, ConnectorDeps, ConnectorSettings};
use dataspace_connector::dispatcher::{DispatcherRegistry, LoopbackDispatcher, ProtocolReceiver};
use dataspace_connector::entity::{EntityId, StatefulEntity};
use dataspace_connector::events::BroadcastEventPublisher;
use dataspace_connector::negotiation::{
    ContractNegotiation, ContractOffer, NegotiationParty, NegotiationState,
};
use dataspace_connector::policy::{Policy, RuleEvaluator};
use dataspace_connector::store::PgEntityStore;
use dataspace_connector::transfer::{
    DataRequest, LocalProvisioner, ProvisionerRegistry, ResourceDefinition, TransferProcess,
    TransferState,
};

const PROVIDER_ID: &str = "provider";
const PROVIDER_ADDRESS: &str = "mem://provider";
const ASSET_ID: &str = "asset-weather-2026";
const PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = dataspace_connector::logging::init_logging(&config)?;

    info!(
        env = %env,
        participant = %config.participant_id,
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        "Starting dataspace connector"
    );

    let loopback = Arc::new(LoopbackDispatcher::new(&config.protocol));
    let dispatcher = Arc::new(DispatcherRegistry::new().with(loopback.clone()));
    let events = Arc::new(BroadcastEventPublisher::new(256));

    let consumer_settings = ConnectorSettings::from_config(&config);
    let provider_settings = ConnectorSettings {
        participant_id: PROVIDER_ID.to_string(),
        address: PROVIDER_ADDRESS.to_string(),
        ..consumer_settings.clone()
    };

    let mut consumer_deps = ConnectorDeps::with_system_clock(dispatcher.clone());
    consumer_deps.events = events.clone();
    consumer_deps.provisioners =
        Arc::new(ProvisionerRegistry::new().with(Arc::new(LocalProvisioner::new("local-dir"))));
    let mut provider_deps = ConnectorDeps::with_system_clock(dispatcher);
    provider_deps.policy = Arc::new(RuleEvaluator);

    if let Some(url) = &config.postgres_url {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .context("connect to PostgreSQL")?;
        for (deps, participant) in [
            (&mut consumer_deps, config.participant_id.as_str()),
            (&mut provider_deps, PROVIDER_ID),
        ] {
            let prefix = table_prefix(participant);
            let negotiations =
                PgEntityStore::<ContractNegotiation>::new(
                    pool.clone(),
                    &format!("{prefix}_contract_negotiations"),
                )?;
            negotiations.ensure_schema().await?;
            let transfers = PgEntityStore::<TransferProcess>::new(
                pool.clone(),
                &format!("{prefix}_transfer_processes"),
            )?;
            transfers.ensure_schema().await?;
            deps.negotiations = Arc::new(negotiations);
            deps.transfers = Arc::new(transfers);
        }
        info!("Using PostgreSQL entity stores");
    }

    let consumer = Connector::new(consumer_settings, consumer_deps)?;
    let provider = Connector::new(provider_settings, provider_deps)?;
    let consumer_rx: Arc<dyn ProtocolReceiver> = consumer.clone();
    let provider_rx: Arc<dyn ProtocolReceiver> = provider.clone();
    loopback.register(consumer.address(), &consumer_rx);
    loopback.register(provider.address(), &provider_rx);

    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!(
                process_type = event.process_type,
                process_id = %event.process_id,
                from = %event.from_state,
                state = %event.state,
                failed = event.failed,
                "Process event"
            );
        }
    });

    consumer.start();
    provider.start();

    let result = run_demo(&consumer, &config.protocol).await;

    consumer.stop().await;
    provider.stop().await;
    result
}

async fn run_demo(consumer: &Connector, protocol: &str) -> anyhow::Result<()> {
    let negotiations = consumer.negotiations();
    let party = NegotiationParty {
        counterparty_id: PROVIDER_ID.to_string(),
        counterparty_address: PROVIDER_ADDRESS.to_string(),
        protocol: protocol.to_string(),
    };
    let offer = ContractOffer::new(ASSET_ID, Policy::permit_use(ASSET_ID, PROVIDER_ID));
    let negotiation_id = negotiations.initiate(party.clone(), offer, Vec::new()).await?;
    info!(negotiation_id = %negotiation_id, asset = ASSET_ID, "Negotiation initiated");

    let negotiation = wait_for("negotiation", negotiation_id, || async move {
        let n = negotiations.find(&negotiation_id).await?;
        Ok::<_, anyhow::Error>(n.filter(|n| n.state().is_some_and(|s| s.is_terminal())))
    })
    .await?;
    let Some(agreement) = negotiation.agreement().cloned() else {
        bail!(
            "negotiation {negotiation_id} ended {:?} without agreement: {}",
            negotiation.state(),
            negotiation.meta.error_detail.as_deref().unwrap_or("-")
        );
    };
    if negotiation.state() != Some(NegotiationState::Finalized) {
        bail!("negotiation {negotiation_id} ended {:?}", negotiation.state());
    }
    info!(agreement_id = %agreement.id, "Contract agreement finalized");

    let transfers = consumer.transfers();
    let request = DataRequest {
        agreement_id: agreement.id.clone(),
        asset_id: agreement.asset_id.clone(),
        protocol: party.protocol,
        counterparty_id: party.counterparty_id,
        counterparty_address: party.counterparty_address,
        transfer_type: "HttpData-PULL".to_string(),
        destination: None,
    };
    let manifest = vec![ResourceDefinition::mandatory("download-dir", "local-dir")];
    let transfer_id = transfers.initiate(request, manifest, Vec::new()).await?;
    info!(transfer_id = %transfer_id, "Transfer initiated");

    let started = wait_for("transfer start", transfer_id, || async move {
        let p = transfers.find(&transfer_id).await?;
        Ok::<_, anyhow::Error>(p.filter(|p| {
            matches!(
                p.state(),
                Some(TransferState::Started | TransferState::Terminated)
            )
        }))
    })
    .await?;
    if started.state() != Some(TransferState::Started) {
        bail!(
            "transfer {transfer_id} terminated: {}",
            started.termination_reason.as_deref().unwrap_or("-")
        );
    }
    info!(
        transfer_id = %transfer_id,
        endpoint = started
            .data_address
            .as_ref()
            .and_then(|a| a.property("endpoint"))
            .unwrap_or("-"),
        "Transfer started"
    );

    transfers.complete(&transfer_id).await?;
    let finished = wait_for("transfer completion", transfer_id, || async move {
        let p = transfers.find(&transfer_id).await?;
        Ok::<_, anyhow::Error>(p.filter(|p| p.state().is_some_and(|s| s.is_terminal())))
    })
    .await?;
    info!(
        transfer_id = %transfer_id,
        state = ?finished.state(),
        "Transfer finished"
    );
    Ok(())
}

/// Poll `check` until it yields a value or the timeout passes
async fn wait_for<T, F, Fut>(what: &str, id: EntityId, mut check: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + PROCESS_TIMEOUT;
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("{what} {id} did not settle within {PROCESS_TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn table_prefix(participant: &str) -> String {
    participant
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

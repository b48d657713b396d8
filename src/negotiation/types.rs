//! Contract negotiation entity and supporting types

use serde::{Deserialize, Serialize};

use super::state::NegotiationState;
use crate::entity::{EntityId, EntityMeta, ProcessState, Role, StatefulEntity};
use crate::events::CallbackAddress;
use crate::policy::Policy;
use crate::store::query::PropertyValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractOffer {
    pub id: String,
    pub asset_id: String,
    pub policy: Policy,
}

impl ContractOffer {
    pub fn new(asset_id: &str, policy: Policy) -> Self {
        Self {
            id: format!("offer-{}", ulid::Ulid::new()),
            asset_id: asset_id.to_string(),
            policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractAgreement {
    pub id: String,
    pub provider_id: String,
    pub consumer_id: String,
    pub asset_id: String,
    pub policy: Policy,
    /// Epoch millis
    pub signed_at: i64,
}

/// Persisted contract negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractNegotiation {
    pub meta: EntityMeta,
    pub role: Role,
    /// The counterparty's process id, once known
    pub correlation_id: Option<String>,
    pub counterparty_id: String,
    pub counterparty_address: String,
    pub protocol: String,
    /// Offer history; the last one is current
    pub contract_offers: Vec<ContractOffer>,
    agreement: Option<ContractAgreement>,
    #[serde(default)]
    pub callback_addresses: Vec<CallbackAddress>,
}

/// Who and what a new negotiation is with
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationParty {
    pub counterparty_id: String,
    pub counterparty_address: String,
    pub protocol: String,
}

impl ContractNegotiation {
    pub fn new(
        role: Role,
        state: NegotiationState,
        party: NegotiationParty,
        offer: ContractOffer,
        now: i64,
    ) -> Self {
        Self {
            meta: EntityMeta::new(EntityId::new(), state.code(), now),
            role,
            correlation_id: None,
            counterparty_id: party.counterparty_id,
            counterparty_address: party.counterparty_address,
            protocol: party.protocol,
            contract_offers: vec![offer],
            agreement: None,
            callback_addresses: Vec::new(),
        }
    }

    pub fn last_offer(&self) -> Option<&ContractOffer> {
        self.contract_offers.last()
    }

    pub fn agreement(&self) -> Option<&ContractAgreement> {
        self.agreement.as_ref()
    }

    /// Attach the agreement; it can be set once and never replaced
    pub fn attach_agreement(&mut self, agreement: ContractAgreement) -> Result<(), String> {
        match &self.agreement {
            Some(existing) if existing.id == agreement.id => Ok(()),
            Some(existing) => Err(format!(
                "agreement {} already attached, refusing {}",
                existing.id, agreement.id
            )),
            None => {
                self.agreement = Some(agreement);
                Ok(())
            }
        }
    }

    /// Own process id as the counterparty sees it
    pub fn pid(&self) -> String {
        self.meta.id.to_string()
    }

    /// `(consumer_pid, provider_pid)` once both are known
    pub fn pids(&self) -> Option<(String, String)> {
        let counterpart = self.correlation_id.clone()?;
        Some(match self.role {
            Role::Consumer => (self.pid(), counterpart),
            Role::Provider => (counterpart, self.pid()),
        })
    }
}

impl StatefulEntity for ContractNegotiation {
    type State = NegotiationState;

    const KIND: &'static str = "contract_negotiation";
    const INDEXED_PROPERTIES: &'static [&'static str] =
        &["role", "counterpartyId", "correlationId", "agreement.id"];

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn deletion_blocker(&self) -> Option<String> {
        self.agreement
            .as_ref()
            .map(|a| format!("negotiation holds agreement {}", a.id))
    }

    fn refuses_state(&self, next: NegotiationState) -> Option<String> {
        match &self.agreement {
            Some(a) if next.is_pre_agreement() => Some(format!(
                "agreement {} is attached, cannot return to {next}",
                a.id
            )),
            _ => None,
        }
    }

    fn property(&self, path: &str) -> Option<PropertyValue> {
        let value = match path {
            "role" => PropertyValue::from(self.role.as_str()),
            "correlationId" => PropertyValue::from(self.correlation_id.clone()),
            "counterpartyId" => PropertyValue::from(self.counterparty_id.as_str()),
            "counterpartyAddress" => PropertyValue::from(self.counterparty_address.as_str()),
            "protocol" => PropertyValue::from(self.protocol.as_str()),
            "agreement.id" => PropertyValue::from(self.agreement.as_ref().map(|a| a.id.clone())),
            "agreement.assetId" => {
                PropertyValue::from(self.agreement.as_ref().map(|a| a.asset_id.clone()))
            }
            "contractOffers.assetId" => PropertyValue::from(
                self.contract_offers
                    .iter()
                    .map(|o| o.asset_id.clone())
                    .collect::<Vec<_>>(),
            ),
            other => return self.meta.property(other),
        };
        Some(value)
    }
}

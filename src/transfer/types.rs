//! Transfer process entity and supporting types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::state::TransferState;
use crate::entity::{EntityId, EntityMeta, ProcessState, Role, StatefulEntity};
use crate::events::CallbackAddress;
use crate::store::query::PropertyValue;

/// Where data is read from or written to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    /// e.g. "HttpData", "AmazonS3"
    pub kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DataAddress {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// What is transferred, under which agreement, with whom
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub agreement_id: String,
    pub asset_id: String,
    pub protocol: String,
    pub counterparty_id: String,
    pub counterparty_address: String,
    /// e.g. "HttpData-PULL"
    pub transfer_type: String,
    pub destination: Option<DataAddress>,
}

/// One entry of the resource manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub id: String,
    /// Selects the provisioner
    pub kind: String,
    pub mandatory: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ResourceDefinition {
    pub fn mandatory(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            mandatory: true,
            properties: BTreeMap::new(),
        }
    }

    pub fn optional(id: &str, kind: &str) -> Self {
        Self {
            mandatory: false,
            ..Self::mandatory(id, kind)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub id: String,
    pub resource_definition_id: String,
    pub kind: String,
    pub data_address: Option<DataAddress>,
    /// Vault key of the resource's secret
    pub secret_key: Option<String>,
    #[serde(default)]
    pub deprovisioned: bool,
}

/// Persisted transfer process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProcess {
    pub meta: EntityMeta,
    pub role: Role,
    /// The counterparty's process id, once known
    pub correlation_id: Option<String>,
    pub data_request: DataRequest,
    #[serde(default)]
    pub resource_manifest: Vec<ResourceDefinition>,
    #[serde(default)]
    pub provisioned_resources: Vec<ProvisionedResource>,
    /// Address the data can be fetched from, set once the flow started
    pub data_address: Option<DataAddress>,
    pub suspension_reason: Option<String>,
    /// Set on termination; deprovisioning then ends in TERMINATED
    pub termination_reason: Option<String>,
    /// The counterparty terminated first and needs no termination message
    #[serde(default)]
    pub counterparty_terminated: bool,
    #[serde(default)]
    pub callback_addresses: Vec<CallbackAddress>,
}

impl TransferProcess {
    pub fn new(
        role: Role,
        data_request: DataRequest,
        resource_manifest: Vec<ResourceDefinition>,
        now: i64,
    ) -> Self {
        Self {
            meta: EntityMeta::new(EntityId::new(), TransferState::Initial.code(), now),
            role,
            correlation_id: None,
            data_request,
            resource_manifest,
            provisioned_resources: Vec::new(),
            data_address: None,
            suspension_reason: None,
            termination_reason: None,
            counterparty_terminated: false,
            callback_addresses: Vec::new(),
        }
    }

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

    pub fn is_provisioned(&self, definition_id: &str) -> bool {
        self.provisioned_resources
            .iter()
            .any(|r| r.resource_definition_id == definition_id)
    }

    /// Manifest entries without a provisioned resource yet
    pub fn unprovisioned(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.resource_manifest
            .iter()
            .filter(|d| !self.is_provisioned(&d.id))
    }

    pub fn mandatory_provisioned(&self) -> bool {
        self.resource_manifest
            .iter()
            .filter(|d| d.mandatory)
            .all(|d| self.is_provisioned(&d.id))
    }

    /// Resources provisioned and not yet released
    pub fn live_resources(&self) -> impl Iterator<Item = &ProvisionedResource> {
        self.provisioned_resources.iter().filter(|r| !r.deprovisioned)
    }

    pub fn has_live_resources(&self) -> bool {
        self.live_resources().next().is_some()
    }

    /// Record a provisioned resource; one per manifest entry
    pub fn add_provisioned(&mut self, resource: ProvisionedResource) {
        if !self.is_provisioned(&resource.resource_definition_id) {
            self.provisioned_resources.push(resource);
        }
    }
}

impl StatefulEntity for TransferProcess {
    type State = TransferState;

    const KIND: &'static str = "transfer_process";
    const INDEXED_PROPERTIES: &'static [&'static str] = &[
        "role",
        "correlationId",
        "dataRequest.agreementId",
        "dataRequest.counterpartyId",
    ];

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn deletion_blocker(&self) -> Option<String> {
        let live = self.live_resources().count();
        (live > 0).then(|| format!("{live} provisioned resource(s) not yet deprovisioned"))
    }

    fn refuses_state(&self, next: TransferState) -> Option<String> {
        let needs_resources = matches!(
            next,
            TransferState::Provisioned | TransferState::Requesting | TransferState::Starting
        );
        if needs_resources && !self.mandatory_provisioned() {
            let missing: Vec<&str> = self
                .unprovisioned()
                .filter(|d| d.mandatory)
                .map(|d| d.id.as_str())
                .collect();
            return Some(format!(
                "mandatory resources not provisioned: {}",
                missing.join(", ")
            ));
        }
        None
    }

    fn property(&self, path: &str) -> Option<PropertyValue> {
        let value = match path {
            "role" => PropertyValue::from(self.role.as_str()),
            "correlationId" => PropertyValue::from(self.correlation_id.clone()),
            "dataRequest.agreementId" => PropertyValue::from(self.data_request.agreement_id.as_str()),
            "dataRequest.assetId" => PropertyValue::from(self.data_request.asset_id.as_str()),
            "dataRequest.counterpartyId" => {
                PropertyValue::from(self.data_request.counterparty_id.as_str())
            }
            "dataRequest.transferType" => {
                PropertyValue::from(self.data_request.transfer_type.as_str())
            }
            "dataRequest.protocol" => PropertyValue::from(self.data_request.protocol.as_str()),
            "provisionedResources.kind" => PropertyValue::from(
                self.provisioned_resources
                    .iter()
                    .map(|r| r.kind.clone())
                    .collect::<Vec<_>>(),
            ),
            other => return self.meta.property(other),
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::query::Criterion;

    fn request() -> DataRequest {
        DataRequest {
            agreement_id: "agreement-1".into(),
            asset_id: "asset-1".into(),
            protocol: "dsp".into(),
            counterparty_id: "provider".into(),
            counterparty_address: "mem://provider".into(),
            transfer_type: "HttpData-PULL".into(),
            destination: None,
        }
    }

    fn resource(def: &str) -> ProvisionedResource {
        ProvisionedResource {
            id: format!("res-{def}"),
            resource_definition_id: def.into(),
            kind: "local".into(),
            data_address: None,
            secret_key: None,
            deprovisioned: false,
        }
    }

    fn process() -> TransferProcess {
        TransferProcess::new(
            Role::Consumer,
            request(),
            vec![
                ResourceDefinition::mandatory("r1", "local"),
                ResourceDefinition::mandatory("r2", "local"),
                ResourceDefinition::optional("r3", "local"),
            ],
            1_000,
        )
    }

    #[test]
    fn test_mandatory_join() {
        let mut p = process();
        assert!(!p.mandatory_provisioned());
        let reason = p.refuses_state(TransferState::Requesting).unwrap();
        assert!(reason.contains("r1, r2"));

        p.add_provisioned(resource("r1"));
        p.add_provisioned(resource("r1"));
        assert_eq!(p.provisioned_resources.len(), 1);
        assert!(p.refuses_state(TransferState::Provisioned).is_some());

        p.add_provisioned(resource("r2"));
        // the optional entry does not hold the join
        assert!(p.mandatory_provisioned());
        assert!(p.refuses_state(TransferState::Provisioned).is_none());
        assert_eq!(p.unprovisioned().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["r3"]);
    }

    #[test]
    fn test_deletion_blocked_by_live_resources() {
        let mut p = process();
        assert!(p.deletion_blocker().is_none());

        p.add_provisioned(resource("r1"));
        assert!(p.deletion_blocker().is_some());

        p.provisioned_resources[0].deprovisioned = true;
        assert!(p.deletion_blocker().is_none());
    }

    #[test]
    fn test_query_properties() {
        let p = process();
        assert!(
            Criterion::equal("dataRequest.agreementId", "agreement-1")
                .matches(&p)
                .unwrap()
        );
        assert!(Criterion::equal("role", "CONSUMER").matches(&p).unwrap());
        assert!(Criterion::equal("state", 100).matches(&p).unwrap());
    }
}

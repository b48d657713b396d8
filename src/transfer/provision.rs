//! Resource provisioning
//!
//! A transfer's manifest lists the resources it needs (a bucket, a token, a
//! staging directory). Each entry is handed to the [`Provisioner`] that
//! claims its kind. Provisioners may finish synchronously or answer
//! `InProgress` and report back later through the transfer service.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::types::{DataAddress, ProvisionedResource, ResourceDefinition};
use crate::entity::EntityId;

/// Result of one provision call
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionResult {
    /// Done; `secret` goes to the vault, never into the entity
    Provisioned {
        resource: ProvisionedResource,
        secret: Option<String>,
    },
    /// Accepted; completion arrives through `notify_provisioned`
    InProgress,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeprovisionResult {
    Deprovisioned,
    Failed(String),
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &str;

    fn can_provision(&self, definition: &ResourceDefinition) -> bool;

    fn can_deprovision(&self, resource: &ProvisionedResource) -> bool;

    /// Must be idempotent per `(process_id, definition.id)`
    async fn provision(
        &self,
        process_id: EntityId,
        definition: &ResourceDefinition,
    ) -> ProvisionResult;

    async fn deprovision(&self, resource: &ProvisionedResource) -> DeprovisionResult;
}

/// Provisioners in registration order; the first match wins
#[derive(Default)]
pub struct ProvisionerRegistry {
    provisioners: Vec<Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) {
        self.provisioners.push(provisioner);
    }

    pub fn with(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.register(provisioner);
        self
    }

    pub fn for_definition(&self, definition: &ResourceDefinition) -> Option<&Arc<dyn Provisioner>> {
        self.provisioners
            .iter()
            .find(|p| p.can_provision(definition))
    }

    pub fn for_resource(&self, resource: &ProvisionedResource) -> Option<&Arc<dyn Provisioner>> {
        self.provisioners
            .iter()
            .find(|p| p.can_deprovision(resource))
    }
}

/// In-process provisioner for one resource kind
///
/// Hands out a local path and a generated token per entry. Failures and
/// deferred completion can be scripted per definition id.
pub struct LocalProvisioner {
    kind: String,
    deferred: bool,
    failures: DashMap<String, String>,
    provisioned: AtomicUsize,
    deprovisioned: AtomicUsize,
}

impl LocalProvisioner {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            deferred: false,
            failures: DashMap::new(),
            provisioned: AtomicUsize::new(0),
            deprovisioned: AtomicUsize::new(0),
        }
    }

    /// Answer `InProgress` instead of provisioning
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    /// Fail every provision of `definition_id` with `message`
    pub fn fail_always(&self, definition_id: &str, message: &str) {
        self.failures
            .insert(definition_id.to_string(), message.to_string());
    }

    pub fn recover(&self, definition_id: &str) {
        self.failures.remove(definition_id);
    }

    pub fn provisioned_count(&self) -> usize {
        self.provisioned.load(Ordering::Relaxed)
    }

    pub fn deprovisioned_count(&self) -> usize {
        self.deprovisioned.load(Ordering::Relaxed)
    }

    /// The resource this provisioner creates for `definition`
    pub fn resource_for(
        &self,
        process_id: EntityId,
        definition: &ResourceDefinition,
    ) -> ProvisionedResource {
        ProvisionedResource {
            id: format!("{}-{}", self.kind, ulid::Ulid::new()),
            resource_definition_id: definition.id.clone(),
            kind: self.kind.clone(),
            data_address: Some(
                DataAddress::new(&self.kind)
                    .with_property("path", format!("/{process_id}/{}", definition.id)),
            ),
            secret_key: None,
            deprovisioned: false,
        }
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    fn name(&self) -> &str {
        &self.kind
    }

    fn can_provision(&self, definition: &ResourceDefinition) -> bool {
        definition.kind == self.kind
    }

    fn can_deprovision(&self, resource: &ProvisionedResource) -> bool {
        resource.kind == self.kind
    }

    async fn provision(
        &self,
        process_id: EntityId,
        definition: &ResourceDefinition,
    ) -> ProvisionResult {
        if let Some(message) = self.failures.get(&definition.id) {
            return ProvisionResult::Failed(message.value().clone());
        }
        if self.deferred {
            return ProvisionResult::InProgress;
        }
        self.provisioned.fetch_add(1, Ordering::Relaxed);
        ProvisionResult::Provisioned {
            resource: self.resource_for(process_id, definition),
            secret: Some(format!("token-{}", ulid::Ulid::new())),
        }
    }

    async fn deprovision(&self, _resource: &ProvisionedResource) -> DeprovisionResult {
        self.deprovisioned.fetch_add(1, Ordering::Relaxed);
        DeprovisionResult::Deprovisioned
    }
}

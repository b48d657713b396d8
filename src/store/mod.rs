//! Entity Store
//!
//! Persistence contract for process entities. The store is the only shared
//! mutable resource between connector instances, so it alone provides the
//! atomicity of claim-and-lease:
//!
//! - `next_not_leased` claims on read: every returned entity is leased to the
//!   caller before the call returns, so two managers racing on one store never
//!   receive the same entity while the lease is live.
//! - `save_and_release` writes a leased entity back and clears its lease in
//!   one step, and refuses when the caller no longer owns the lease.
//! - Leases belong to the store; `upsert` never overwrites one.

pub mod memory;
pub mod postgres;
pub mod query;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::entity::{EntityId, Lease, StatefulEntity};

pub use memory::InMemoryEntityStore;
pub use postgres::PgEntityStore;
pub use query::{Criterion, Operator, PropertyValue, QueryError, QuerySpec, SortOrder};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(EntityId),

    #[error("Entity already exists: {0}")]
    AlreadyExists(EntityId),

    #[error("Entity {id} is leased by {holder}")]
    LeaseConflict { id: EntityId, holder: String },

    #[error("Entity {id} cannot be deleted: {reason}")]
    DeletionRefused { id: EntityId, reason: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(#[from] QueryError),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::AlreadyExists(_) => "ALREADY_EXISTS",
            StoreError::LeaseConflict { .. } => "LEASE_CONFLICT",
            StoreError::DeletionRefused { .. } => "DELETION_REFUSED",
            StoreError::InvalidQuery(_) => "INVALID_QUERY",
            StoreError::Backend(_) => "BACKEND_ERROR",
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::LeaseConflict { .. } | StoreError::Backend(_)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("serialization: {e}"))
    }
}

/// Parameters of one claim-on-read batch
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    /// State code the entities must be in
    pub state: i32,
    /// Extra criteria, e.g. the process role
    pub filter: &'a [Criterion],
    pub max: usize,
    pub holder: &'a str,
    pub lease_duration: Duration,
    pub now: i64,
}

#[async_trait]
pub trait EntityStore<T: StatefulEntity>: Send + Sync {
    async fn find(&self, id: &EntityId) -> Result<Option<T>, StoreError>;

    /// Insert or fully replace by id; the stored lease is preserved
    async fn upsert(&self, entity: T) -> Result<(), StoreError>;

    /// Refuses when the entity reports a deletion blocker or is leased
    async fn delete(&self, id: &EntityId) -> Result<(), StoreError>;

    /// Claim up to `max` due, unleased, non-pending entities in `state`,
    /// oldest `state_timestamp` first
    ///
    /// A live lease excludes an entity even when `claim.holder` holds it;
    /// only `acquire_lease` extends a lease in place.
    async fn next_not_leased(&self, claim: &ClaimRequest<'_>) -> Result<Vec<T>, StoreError>;

    /// Take or extend a lease; `LeaseConflict` if another holder's lease is live
    async fn acquire_lease(
        &self,
        id: &EntityId,
        holder: &str,
        duration: Duration,
        now: i64,
    ) -> Result<Lease, StoreError>;

    /// Clear a lease; `LeaseConflict` if `holder` does not own it
    async fn release_lease(&self, id: &EntityId, holder: &str) -> Result<(), StoreError>;

    /// Persist an entity leased by `holder` and clear the lease atomically
    async fn save_and_release(&self, entity: T, holder: &str) -> Result<(), StoreError>;

    async fn query(&self, query: &QuerySpec) -> Result<Vec<T>, StoreError>;
}

//! Stateful Entity
//!
//! The persisted record of one process instance. Concrete processes
//! (contract negotiation, transfer process) embed an [`EntityMeta`] and
//! implement [`StatefulEntity`] so the store and the state machine manager
//! can treat them generically.

#[cfg(test)]
pub mod fixtures;
pub mod lease;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

pub use lease::Lease;

use crate::store::query::PropertyValue;

/// Entity ID - ULID-based unique identifier
///
/// ULIDs sort by creation time and need no coordination between
/// connector instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(ulid::Ulid);

impl EntityId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Side of the contract a process instance acts for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Consumer,
    Provider,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Consumer => "CONSUMER",
            Role::Provider => "PROVIDER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node in a process state graph
///
/// States are persisted as integer codes so that stores can filter on them
/// without knowing the concrete enum.
pub trait ProcessState:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    fn code(self) -> i32;

    fn from_code(code: i32) -> Option<Self>;

    fn as_str(self) -> &'static str;

    /// Every state of the process, in code order
    fn all() -> &'static [Self];
}

/// Fields shared by every process entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub id: EntityId,
    pub state: i32,
    /// Last transition time, or the earliest time the entity is due again
    /// after a retry
    pub state_timestamp: i64,
    pub retry_count: u32,
    pub error_detail: Option<String>,
    #[serde(default)]
    pub trace_context: BTreeMap<String, String>,
    #[serde(default)]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub pending: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EntityMeta {
    pub fn new(id: EntityId, state: i32, now: i64) -> Self {
        Self {
            id,
            state,
            state_timestamp: now,
            retry_count: 0,
            error_detail: None,
            trace_context: BTreeMap::new(),
            lease: None,
            pending: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a successful transition
    pub fn transition(&mut self, state: i32, now: i64) {
        self.state = state;
        self.state_timestamp = now;
        self.retry_count = 0;
        self.pending = false;
        self.updated_at = now;
    }

    /// Whether the entity may be claimed at `now`
    #[inline]
    pub fn is_due(&self, now: i64) -> bool {
        self.state_timestamp <= now
    }

    /// Resolve the shared properties for the query interpreter
    pub fn property(&self, path: &str) -> Option<PropertyValue> {
        let value = match path {
            "id" => PropertyValue::from(self.id.to_string()),
            "state" => PropertyValue::Int(self.state as i64),
            "stateTimestamp" => PropertyValue::Int(self.state_timestamp),
            "retryCount" => PropertyValue::Int(self.retry_count as i64),
            "errorDetail" => PropertyValue::from(self.error_detail.clone()),
            "pending" => PropertyValue::Bool(self.pending),
            "createdAt" => PropertyValue::Int(self.created_at),
            "updatedAt" => PropertyValue::Int(self.updated_at),
            "lease.holder" => PropertyValue::from(self.lease.as_ref().map(|l| l.holder.clone())),
            _ => return None,
        };
        Some(value)
    }
}

/// A persisted process instance with an explicit state
pub trait StatefulEntity: Clone + Send + Sync + 'static {
    type State: ProcessState;

    /// Process type name, used in logs and events
    const KIND: &'static str;

    /// Scalar properties a store may index for equality lookups
    const INDEXED_PROPERTIES: &'static [&'static str] = &[];

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn id(&self) -> EntityId {
        self.meta().id
    }

    fn state(&self) -> Option<Self::State> {
        Self::State::from_code(self.meta().state)
    }

    /// Reason this entity must not be deleted, if any
    fn deletion_blocker(&self) -> Option<String> {
        None
    }

    /// Entity-level veto on entering `next`, checked after the graph edge
    fn refuses_state(&self, _next: Self::State) -> Option<String> {
        None
    }

    /// Property lookup for typed query criteria
    fn property(&self, path: &str) -> Option<PropertyValue> {
        self.meta().property(path)
    }
}

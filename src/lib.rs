//! Dataspace Connector - Process Engine
//!
//! Persistent, lease-coordinated state machines for contract negotiations
//! and data transfers between dataspace participants.
//!
//! # Modules
//!
//! - [`entity`] - Entity ids, metadata, leases and the `StatefulEntity` trait
//! - [`store`] - Entity store contract, typed queries, in-memory and PostgreSQL stores
//! - [`clock`] - System and manually driven time
//! - [`state_machine`] - Graphs, handlers, retry policy, manager loop, commands
//! - [`negotiation`] - Contract Negotiation (consumer + provider)
//! - [`transfer`] - Transfer Process (consumer + provider)
//! - [`policy`] - Usage policies and their evaluation
//! - [`dispatcher`] - Protocol messages and their delivery
//! - [`vault`] - Secret storage
//! - [`events`] - Process events
//! - [`connector`] - One participant wired together
//! - [`config`], [`logging`] - Ambient configuration and tracing setup

// Core types - must be first!
pub mod clock;
pub mod entity;
pub mod store;

// Engine
pub mod state_machine;

// Collaborators
pub mod dispatcher;
pub mod events;
pub mod policy;
pub mod vault;

// Processes
pub mod negotiation;
pub mod transfer;

pub mod config;
pub mod connector;
pub mod logging;

// Convenient re-exports at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use connector::{Connector, ConnectorDeps, ConnectorSettings, ConnectorTick};
pub use entity::{EntityId, EntityMeta, ProcessState, Role, StatefulEntity};
pub use negotiation::{ContractNegotiation, NegotiationService, NegotiationState};
pub use state_machine::{ManagerConfig, RetryPolicy, StateMachineManager, StepOutcome};
pub use store::{EntityStore, InMemoryEntityStore, PgEntityStore};
pub use transfer::{TransferProcess, TransferService, TransferState};

//! Entity state-machine processing engine
//!
//! - [`graph`]: legal edges, terminal and announced states of a process role
//! - [`handler`]: per-state work and the pending guard
//! - [`retry`]: bounded exponential backoff
//! - [`manager`]: the claim / handle / write-back loop
//! - [`command`]: lease-respecting mutations from outside the loop

pub mod command;
pub mod error;
pub mod graph;
pub mod handler;
pub mod manager;
pub mod retry;

pub use command::{CommandError, CommandExecutor, GraphSelector};
pub use error::EngineError;
pub use graph::StateGraph;
pub use handler::{FnHandler, HandlerFuture, NeverPending, PendingGuard, StateHandler, StepOutcome};
pub use manager::{
    ManagerConfig, StateMachine, StateMachineManager, StepKind, StepRecord, TickReport,
};
pub use retry::RetryPolicy;

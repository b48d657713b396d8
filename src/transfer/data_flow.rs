//! Data plane control
//!
//! The provider side starts, suspends and stops the actual data movement
//! through a [`DataFlowController`]. The engine never moves data itself.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use super::types::{DataAddress, TransferProcess};
use crate::entity::{EntityId, ProcessState};
use crate::state_machine::StepOutcome;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataFlowError {
    #[error("Data plane unavailable: {0}")]
    Transient(String),

    #[error("Data flow rejected: {0}")]
    Rejected(String),
}

impl DataFlowError {
    /// Handler outcome for a failed data plane call
    pub fn outcome<S: ProcessState>(&self) -> StepOutcome<S> {
        match self {
            DataFlowError::Transient(_) => StepOutcome::Retry(self.to_string()),
            DataFlowError::Rejected(_) => StepOutcome::Fatal(self.to_string()),
        }
    }
}

#[async_trait]
pub trait DataFlowController: Send + Sync {
    /// Start (or restart) the flow; pull transfers return the address the
    /// consumer fetches from
    async fn start(&self, process: &TransferProcess) -> Result<Option<DataAddress>, DataFlowError>;

    async fn suspend(&self, process_id: EntityId) -> Result<(), DataFlowError>;

    /// Stopping an unknown or stopped flow succeeds
    async fn terminate(&self, process_id: EntityId) -> Result<(), DataFlowError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Started,
    Suspended,
    Terminated,
}

/// Bookkeeping-only data plane for demos and tests
#[derive(Debug, Default)]
pub struct InProcessDataFlow {
    flows: DashMap<EntityId, FlowStatus>,
}

impl InProcessDataFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, process_id: &EntityId) -> Option<FlowStatus> {
        self.flows.get(process_id).map(|s| *s)
    }
}

#[async_trait]
impl DataFlowController for InProcessDataFlow {
    async fn start(&self, process: &TransferProcess) -> Result<Option<DataAddress>, DataFlowError> {
        let id = process.meta.id;
        if self.status(&id) == Some(FlowStatus::Terminated) {
            return Err(DataFlowError::Rejected(format!("flow {id} already terminated")));
        }
        self.flows.insert(id, FlowStatus::Started);

        let pull = process.data_request.transfer_type.ends_with("-PULL");
        Ok(pull.then(|| {
            DataAddress::new("HttpData")
                .with_property("endpoint", format!("mem://flows/{id}"))
                .with_property("assetId", process.data_request.asset_id.clone())
        }))
    }

    async fn suspend(&self, process_id: EntityId) -> Result<(), DataFlowError> {
        match self.flows.get_mut(&process_id) {
            Some(mut status) if *status == FlowStatus::Started => {
                *status = FlowStatus::Suspended;
                Ok(())
            }
            Some(status) => Err(DataFlowError::Rejected(format!(
                "flow {process_id} is {:?}",
                *status
            ))),
            None => Err(DataFlowError::Rejected(format!("no flow {process_id}"))),
        }
    }

    async fn terminate(&self, process_id: EntityId) -> Result<(), DataFlowError> {
        if let Some(mut status) = self.flows.get_mut(&process_id) {
            *status = FlowStatus::Terminated;
        }
        Ok(())
    }
}

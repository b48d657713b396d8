//! Transfer Process
//!
//! Moves the data of an agreed asset. The consumer provisions its
//! resources and requests; the provider checks the agreement, provisions,
//! and starts the data flow.
//!
//! ```text
//! consumer                                    provider
//! INITIAL -> PROVISIONING -> PROVISIONED
//! REQUESTING --request-->                     INITIAL -> PROVISIONING
//!                                             PROVISIONED -> STARTING
//! STARTED    <--------start (data address)--  STARTED
//! COMPLETING --completion-->                  DEPROVISIONING -> COMPLETED
//! DEPROVISIONING -> COMPLETED
//! ```

pub mod data_flow;
pub mod error;
pub mod handlers;
pub mod provision;
pub mod service;
pub mod state;
pub mod types;

pub use data_flow::{DataFlowController, DataFlowError, FlowStatus, InProcessDataFlow};
pub use error::TransferError;
pub use handlers::{TransferContext, secret_key};
pub use provision::{
    DeprovisionResult, LocalProvisioner, ProvisionResult, Provisioner, ProvisionerRegistry,
};
pub use service::TransferService;
pub use state::{TransferState, transfer_graph};
pub use types::{DataAddress, DataRequest, ProvisionedResource, ResourceDefinition, TransferProcess};

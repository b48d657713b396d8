//! Transfer Error Types

use thiserror::Error;

use crate::dispatcher::DispatchError;
use crate::negotiation::NegotiationError;
use crate::state_machine::{CommandError, EngineError};
use crate::store::StoreError;
use crate::vault::VaultError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    // === Lookup ===
    #[error("Transfer process not found: {0}")]
    NotFound(String),

    #[error("Transfer process {0} is busy, retry later")]
    Busy(String),

    // === Protocol ===
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Counterparty mismatch: expected {expected}, got {actual}")]
    CounterpartyMismatch { expected: String, actual: String },

    #[error("No finalized agreement {0}")]
    AgreementNotFound(String),

    #[error("Operation not allowed for a {0} transfer")]
    WrongRole(String),

    #[error("Unknown resource definition: {0}")]
    UnknownResource(String),

    // === System ===
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("Agreement lookup failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransferError {
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::NotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::Busy(_) => "BUSY",
            TransferError::InvalidMessage(_) => "INVALID_MESSAGE",
            TransferError::CounterpartyMismatch { .. } => "COUNTERPARTY_MISMATCH",
            TransferError::AgreementNotFound(_) => "AGREEMENT_NOT_FOUND",
            TransferError::WrongRole(_) => "WRONG_ROLE",
            TransferError::UnknownResource(_) => "UNKNOWN_RESOURCE",
            TransferError::Vault(_) => "VAULT_ERROR",
            TransferError::Negotiation(e) => e.code(),
            TransferError::Engine(e) => e.code(),
            TransferError::Store(e) => e.code(),
        }
    }

    /// Protocol answer for an inbound message that failed with this error
    pub fn to_dispatch(&self) -> DispatchError {
        match self {
            TransferError::Busy(_) | TransferError::Vault(_) => {
                DispatchError::Unavailable(self.to_string())
            }
            TransferError::Negotiation(e) if e.to_dispatch().is_retryable() => {
                DispatchError::Unavailable(self.to_string())
            }
            TransferError::Store(e) | TransferError::Engine(EngineError::Store(e))
                if e.is_transient() =>
            {
                DispatchError::Unavailable(self.to_string())
            }
            _ => DispatchError::Rejected(self.to_string()),
        }
    }
}

impl From<CommandError> for TransferError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Busy(id) => TransferError::Busy(id.to_string()),
            CommandError::NotFound(id) => TransferError::NotFound(id.to_string()),
            CommandError::Engine(e) => TransferError::Engine(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;

    #[test]
    fn test_dispatch_mapping() {
        let busy: TransferError = CommandError::Busy(EntityId::new()).into();
        assert_eq!(busy.code(), "BUSY");
        assert!(busy.to_dispatch().is_retryable());

        let missing = TransferError::AgreementNotFound("a-1".into());
        assert_eq!(missing.to_dispatch().code(), "REJECTED");

        let lookup = TransferError::Negotiation(NegotiationError::Store(StoreError::Backend(
            "down".into(),
        )));
        assert!(lookup.to_dispatch().is_retryable());
    }
}

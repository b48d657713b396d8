//! Negotiation Error Types

use thiserror::Error;

use crate::dispatcher::DispatchError;
use crate::state_machine::{CommandError, EngineError};
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NegotiationError {
    // === Lookup ===
    #[error("Negotiation not found: {0}")]
    NotFound(String),

    #[error("Negotiation {0} is busy, retry later")]
    Busy(String),

    // === Protocol ===
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Counterparty mismatch: expected {expected}, got {actual}")]
    CounterpartyMismatch { expected: String, actual: String },

    #[error("Agreement conflict: {0}")]
    AgreementConflict(String),

    #[error("Operation not allowed for a {0} negotiation")]
    WrongRole(String),

    // === System ===
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl NegotiationError {
    pub fn code(&self) -> &'static str {
        match self {
            NegotiationError::NotFound(_) => "NEGOTIATION_NOT_FOUND",
            NegotiationError::Busy(_) => "BUSY",
            NegotiationError::InvalidMessage(_) => "INVALID_MESSAGE",
            NegotiationError::CounterpartyMismatch { .. } => "COUNTERPARTY_MISMATCH",
            NegotiationError::AgreementConflict(_) => "AGREEMENT_CONFLICT",
            NegotiationError::WrongRole(_) => "WRONG_ROLE",
            NegotiationError::Engine(e) => e.code(),
            NegotiationError::Store(e) => e.code(),
        }
    }

    /// Protocol answer for an inbound message that failed with this error
    pub fn to_dispatch(&self) -> DispatchError {
        match self {
            NegotiationError::Busy(_) => DispatchError::Unavailable(self.to_string()),
            NegotiationError::Store(e) | NegotiationError::Engine(EngineError::Store(e))
                if e.is_transient() =>
            {
                DispatchError::Unavailable(self.to_string())
            }
            _ => DispatchError::Rejected(self.to_string()),
        }
    }
}

impl From<CommandError> for NegotiationError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Busy(id) => NegotiationError::Busy(id.to_string()),
            CommandError::NotFound(id) => NegotiationError::NotFound(id.to_string()),
            CommandError::Engine(e) => NegotiationError::Engine(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;

    #[test]
    fn test_dispatch_mapping() {
        let busy: NegotiationError = CommandError::Busy(EntityId::new()).into();
        assert!(busy.to_dispatch().is_retryable());

        let missing = NegotiationError::NotFound("x".into());
        assert_eq!(missing.to_dispatch().code(), "REJECTED");

        let backend = NegotiationError::Store(StoreError::Backend("down".into()));
        assert!(backend.to_dispatch().is_retryable());
    }
}

//! Engine Error Types

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Illegal {process} transition {from} -> {to}")]
    IllegalTransition {
        process: &'static str,
        from: String,
        to: String,
    },

    #[error("{process} refuses to enter {state}: {reason}")]
    Refused {
        process: &'static str,
        state: String,
        reason: String,
    },

    #[error("Unknown {process} state code {code}")]
    UnknownState { process: &'static str, code: i32 },

    #[error("Invalid state machine definition: {0}")]
    Registration(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            EngineError::Refused { .. } => "TRANSITION_REFUSED",
            EngineError::UnknownState { .. } => "UNKNOWN_STATE",
            EngineError::Registration(_) => "INVALID_STATE_MACHINE",
            EngineError::Store(e) => e.code(),
        }
    }
}

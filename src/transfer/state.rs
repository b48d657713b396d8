//! Transfer process states and graph
//!
//! Codes are persisted; do not renumber. Both roles share one graph; which
//! edges a role actually takes is decided by its handlers.

use std::fmt;
use std::sync::{Arc, LazyLock};

use crate::entity::ProcessState;
use crate::state_machine::StateGraph;

/// Transfer process states
///
/// Terminal states: COMPLETED (800), TERMINATED (850)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TransferState {
    Initial = 100,
    Provisioning = 200,
    /// Waiting for an asynchronous provisioner callback
    ProvisioningRequested = 250,
    Provisioned = 300,
    Requesting = 400,
    Requested = 500,
    Starting = 550,
    Started = 600,
    Suspending = 650,
    Suspended = 700,
    Resuming = 720,
    Completing = 750,
    /// Terminal: data delivered and resources released
    Completed = 800,
    Terminating = 825,
    /// Terminal: also the failure state
    Terminated = 850,
    Deprovisioning = 900,
}

const ALL: [TransferState; 16] = [
    TransferState::Initial,
    TransferState::Provisioning,
    TransferState::ProvisioningRequested,
    TransferState::Provisioned,
    TransferState::Requesting,
    TransferState::Requested,
    TransferState::Starting,
    TransferState::Started,
    TransferState::Suspending,
    TransferState::Suspended,
    TransferState::Resuming,
    TransferState::Completing,
    TransferState::Completed,
    TransferState::Terminating,
    TransferState::Terminated,
    TransferState::Deprovisioning,
];

impl TransferState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Terminated)
    }
}

impl ProcessState for TransferState {
    fn code(self) -> i32 {
        self as i32
    }

    fn from_code(code: i32) -> Option<Self> {
        ALL.iter().copied().find(|s| *s as i32 == code)
    }

    fn as_str(self) -> &'static str {
        match self {
            TransferState::Initial => "INITIAL",
            TransferState::Provisioning => "PROVISIONING",
            TransferState::ProvisioningRequested => "PROVISIONING_REQUESTED",
            TransferState::Provisioned => "PROVISIONED",
            TransferState::Requesting => "REQUESTING",
            TransferState::Requested => "REQUESTED",
            TransferState::Starting => "STARTING",
            TransferState::Started => "STARTED",
            TransferState::Suspending => "SUSPENDING",
            TransferState::Suspended => "SUSPENDED",
            TransferState::Resuming => "RESUMING",
            TransferState::Completing => "COMPLETING",
            TransferState::Completed => "COMPLETED",
            TransferState::Terminating => "TERMINATING",
            TransferState::Terminated => "TERMINATED",
            TransferState::Deprovisioning => "DEPROVISIONING",
        }
    }

    fn all() -> &'static [Self] {
        &ALL
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

use TransferState::*;

static GRAPH: LazyLock<Arc<StateGraph<TransferState>>> = LazyLock::new(|| {
    Arc::new(
        StateGraph::new(
            "transfer_process",
            Initial,
            &[Completed, Terminated],
            &[
                (Initial, Provisioning),
                (Provisioning, ProvisioningRequested),
                (Provisioning, Provisioned),
                (ProvisioningRequested, Provisioned),
                (Provisioned, Requesting),
                (Provisioned, Starting),
                (Requesting, Requested),
                (Requested, Started),
                (Starting, Started),
                (Started, Suspending),
                (Started, Suspended),
                (Started, Completing),
                (Started, Deprovisioning),
                (Suspending, Suspended),
                (Suspended, Resuming),
                (Suspended, Starting),
                (Suspended, Started),
                (Resuming, Started),
                (Resuming, Starting),
                (Completing, Deprovisioning),
                (Terminating, Deprovisioning),
                (Terminating, Terminated),
                (Deprovisioning, Completed),
                (Deprovisioning, Terminated),
            ],
        )
        .with_escape_to(&[Terminating, Terminated])
        .with_announced(&[Provisioned, Requested, Started, Suspended, Completed, Terminated]),
    )
});

pub fn transfer_graph() -> Arc<StateGraph<TransferState>> {
    GRAPH.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_code_roundtrip() {
        for state in ALL {
            assert_eq!(TransferState::from_code(state.code()), Some(state));
        }
        assert_eq!(Initial.code(), 100);
        assert_eq!(ProvisioningRequested.code(), 250);
        assert_eq!(Deprovisioning.code(), 900);
        assert!(TransferState::from_code(0).is_none());
    }

    #[test]
    fn test_graph_edges() {
        let g = transfer_graph();
        assert!(g.allows(Provisioned, Requesting));
        assert!(g.allows(Provisioned, Starting));
        assert!(g.allows(Deprovisioning, Completed));
        assert!(g.allows(Deprovisioning, Terminating));
        assert!(!g.allows(Requested, Completed));
        assert!(!g.allows(Initial, Started));
        // terminals have no way out
        assert!(!g.allows(Completed, Terminating));
        assert!(!g.allows(Terminated, Terminating));
        assert!(g.is_announced(Started));
        assert!(!g.is_announced(Starting));
    }
}

//! Contract negotiation states and graphs
//!
//! Codes are persisted; do not renumber.

use std::fmt;
use std::sync::{Arc, LazyLock};

use crate::entity::{ProcessState, Role};
use crate::state_machine::StateGraph;

/// Contract negotiation states
///
/// Terminal states: FINALIZED (1200), TERMINATED (1400)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum NegotiationState {
    Initial = 50,
    Requesting = 100,
    Requested = 200,
    Offering = 300,
    Offered = 400,
    Accepting = 700,
    Accepted = 800,
    Agreeing = 825,
    Agreed = 850,
    Verifying = 1050,
    Verified = 1100,
    Finalizing = 1150,
    /// Terminal: agreement in force
    Finalized = 1200,
    Terminating = 1300,
    /// Terminal: also the failure state
    Terminated = 1400,
}

const ALL: [NegotiationState; 15] = [
    NegotiationState::Initial,
    NegotiationState::Requesting,
    NegotiationState::Requested,
    NegotiationState::Offering,
    NegotiationState::Offered,
    NegotiationState::Accepting,
    NegotiationState::Accepted,
    NegotiationState::Agreeing,
    NegotiationState::Agreed,
    NegotiationState::Verifying,
    NegotiationState::Verified,
    NegotiationState::Finalizing,
    NegotiationState::Finalized,
    NegotiationState::Terminating,
    NegotiationState::Terminated,
];

impl NegotiationState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationState::Finalized | NegotiationState::Terminated
        )
    }

    /// States in which no agreement can exist yet
    #[inline]
    pub fn is_pre_agreement(&self) -> bool {
        (*self as i32) < NegotiationState::Agreed as i32
    }
}

impl ProcessState for NegotiationState {
    fn code(self) -> i32 {
        self as i32
    }

    fn from_code(code: i32) -> Option<Self> {
        ALL.iter().copied().find(|s| *s as i32 == code)
    }

    fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Initial => "INITIAL",
            NegotiationState::Requesting => "REQUESTING",
            NegotiationState::Requested => "REQUESTED",
            NegotiationState::Offering => "OFFERING",
            NegotiationState::Offered => "OFFERED",
            NegotiationState::Accepting => "ACCEPTING",
            NegotiationState::Accepted => "ACCEPTED",
            NegotiationState::Agreeing => "AGREEING",
            NegotiationState::Agreed => "AGREED",
            NegotiationState::Verifying => "VERIFYING",
            NegotiationState::Verified => "VERIFIED",
            NegotiationState::Finalizing => "FINALIZING",
            NegotiationState::Finalized => "FINALIZED",
            NegotiationState::Terminating => "TERMINATING",
            NegotiationState::Terminated => "TERMINATED",
        }
    }

    fn all() -> &'static [Self] {
        &ALL
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

use NegotiationState::*;

const TERMINALS: [NegotiationState; 2] = [Finalized, Terminated];
const ANNOUNCED: [NegotiationState; 7] =
    [Requested, Offered, Accepted, Agreed, Verified, Finalized, Terminated];

static CONSUMER_GRAPH: LazyLock<Arc<StateGraph<NegotiationState>>> = LazyLock::new(|| {
    Arc::new(
        StateGraph::new(
            "contract_negotiation/consumer",
            Initial,
            &TERMINALS,
            &[
                (Initial, Requesting),
                (Requesting, Requested),
                (Requested, Offered),
                (Requested, Agreed),
                (Offered, Accepting),
                (Offered, Requesting),
                (Accepting, Accepted),
                (Accepted, Agreed),
                (Agreed, Verifying),
                (Verifying, Verified),
                (Verified, Finalized),
            ],
        )
        .with_escape_to(&[Terminating, Terminated])
        .with_announced(&ANNOUNCED),
    )
});

static PROVIDER_GRAPH: LazyLock<Arc<StateGraph<NegotiationState>>> = LazyLock::new(|| {
    Arc::new(
        StateGraph::new(
            "contract_negotiation/provider",
            Initial,
            &TERMINALS,
            &[
                (Initial, Offering),
                (Offering, Offered),
                (Requested, Agreeing),
                (Requested, Offering),
                (Offered, Accepted),
                (Offered, Requested),
                (Accepted, Agreeing),
                (Agreeing, Agreed),
                (Agreed, Verified),
                (Verified, Finalizing),
                (Finalizing, Finalized),
            ],
        )
        .with_escape_to(&[Terminating, Terminated])
        .with_announced(&ANNOUNCED),
    )
});

pub fn graph_for_role(role: Role) -> Arc<StateGraph<NegotiationState>> {
    match role {
        Role::Consumer => CONSUMER_GRAPH.clone(),
        Role::Provider => PROVIDER_GRAPH.clone(),
    }
}

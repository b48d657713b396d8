//! Process state graph
//!
//! Nodes, legal edges, terminal states and announced states of one process
//! role. Every state change, whether made by the manager or by a service
//! command, goes through [`StateGraph::apply`].

use std::collections::{HashMap, HashSet};

use super::error::EngineError;
use crate::entity::{ProcessState, StatefulEntity};

#[derive(Debug, Clone)]
pub struct StateGraph<S: ProcessState> {
    process: &'static str,
    initial: S,
    terminals: HashSet<S>,
    edges: HashMap<S, HashSet<S>>,
    announced: HashSet<S>,
}

impl<S: ProcessState> StateGraph<S> {
    pub fn new(process: &'static str, initial: S, terminals: &[S], edges: &[(S, S)]) -> Self {
        let mut graph = Self {
            process,
            initial,
            terminals: terminals.iter().copied().collect(),
            edges: HashMap::new(),
            announced: HashSet::new(),
        };
        for &(from, to) in edges {
            graph.edges.entry(from).or_default().insert(to);
        }
        graph
    }

    /// Add `from -> target` for every non-terminal `from` other than the target
    pub fn with_escape_to(mut self, targets: &[S]) -> Self {
        for &from in S::all() {
            if self.terminals.contains(&from) {
                continue;
            }
            for &to in targets {
                if from != to {
                    self.edges.entry(from).or_default().insert(to);
                }
            }
        }
        self
    }

    pub fn with_announced(mut self, states: &[S]) -> Self {
        self.announced.extend(states.iter().copied());
        self
    }

    pub fn process(&self) -> &'static str {
        self.process
    }

    pub fn initial(&self) -> S {
        self.initial
    }

    #[inline]
    pub fn is_terminal(&self, state: S) -> bool {
        self.terminals.contains(&state)
    }

    #[inline]
    pub fn is_announced(&self, state: S) -> bool {
        self.announced.contains(&state)
    }

    #[inline]
    pub fn allows(&self, from: S, to: S) -> bool {
        self.edges.get(&from).is_some_and(|next| next.contains(&to))
    }

    pub fn check(&self, from: S, to: S) -> Result<(), EngineError> {
        if self.allows(from, to) {
            Ok(())
        } else {
            Err(EngineError::IllegalTransition {
                process: self.process,
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Current state of `entity`, rejecting codes this graph does not know
    pub fn state_of<T: StatefulEntity<State = S>>(&self, entity: &T) -> Result<S, EngineError> {
        entity.state().ok_or(EngineError::UnknownState {
            process: self.process,
            code: entity.meta().state,
        })
    }

    /// Check the edge and the entity's own veto, then record the transition
    pub fn apply<T: StatefulEntity<State = S>>(
        &self,
        entity: &mut T,
        next: S,
        now: i64,
    ) -> Result<S, EngineError> {
        let from = self.state_of(entity)?;
        self.check(from, next)?;
        if let Some(reason) = entity.refuses_state(next) {
            return Err(EngineError::Refused {
                process: self.process,
                state: next.to_string(),
                reason,
            });
        }
        entity.meta_mut().transition(next.code(), now);
        Ok(from)
    }

    /// States that have outgoing edges
    pub fn non_terminal_states(&self) -> impl Iterator<Item = S> + '_ {
        S::all().iter().copied().filter(|s| !self.is_terminal(*s))
    }
}

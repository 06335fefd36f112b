//! Table-driven mapping of foreign-state observations onto the generalized
//! state machine

use super::foreign_state::{ForeignState, StateCode};
use super::state::{ExecutionState, ExecutionStateName, StateError};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while mapping an observation onto the state machine
#[derive(Debug, Error)]
pub enum MapperError {
    /// The attempted transition is outside the precomputed closure. This is
    /// a backend-modeling bug, not a recoverable runtime condition.
    #[error("Forbidden state transition triggered by {foreign_state}: {from} -> {to}")]
    ForbiddenTransition {
        /// Display form of the observation that triggered the transition
        foreign_state: String,
        /// The state being left
        from: ExecutionStateName,
        /// The state suggested by the observation
        to: ExecutionStateName,
    },

    /// A syntactically valid backend code has no entry in the mapping
    /// table. This is a system error, never silently ignored.
    #[error("No execution state mapped for foreign state code '{code}'")]
    UnmappedCode {
        /// Display form of the unmapped backend code
        code: String,
    },

    /// State-machine invariant violated while absorbing the observation
    #[error(transparent)]
    State(#[from] StateError),
}

/// Pure, table-driven state mapper.
///
/// Constructed from a static code-to-state table; sufficient for all
/// current backends. State identity is decided purely by the mapped state
/// name, never by raw backend-code equality, so two different codes mapping
/// to the same state never cause a spurious transition.
#[derive(Debug, Clone)]
pub struct SimpleStateMapper<S: StateCode> {
    table: HashMap<S, ExecutionStateName>,
}

impl<S: StateCode> SimpleStateMapper<S> {
    /// Build a mapper from a code-to-state table
    pub fn new(table: HashMap<S, ExecutionStateName>) -> Self {
        Self { table }
    }

    /// Look up the execution state suggested by a backend code
    fn lookup(&self, code: &S) -> Result<ExecutionStateName, MapperError> {
        self.table
            .get(code)
            .copied()
            .ok_or_else(|| MapperError::UnmappedCode {
                code: code.to_string(),
            })
    }

    /// Compute the next execution state from the current state and a fresh
    /// observation.
    ///
    /// - `Start` always transitions; there is nothing to accept into.
    /// - Unknown observations never transition: they are absorbed into the
    ///   current state, modeling "wait indefinitely for recovery".
    /// - An observation mapping to the current state's name is absorbed.
    /// - Anything else closes the current state and seeds the successor
    ///   with the same observation, after validating the transition.
    pub fn transition(
        &self,
        mut current: ExecutionState<S>,
        observed: ForeignState<S>,
    ) -> Result<ExecutionState<S>, MapperError> {
        if current.name() == ExecutionStateName::Start {
            // Start holds no observations, so an unknown first poll leaves
            // it untouched.
            if !observed.is_known() {
                return Ok(current);
            }
            let next = self.lookup(observed.code())?;
            if !ExecutionStateName::Start.can_transition_to(next) {
                return Err(MapperError::ForbiddenTransition {
                    foreign_state: observed.to_string(),
                    from: ExecutionStateName::Start,
                    to: next,
                });
            }
            current.close(observed.clone())?;
            return Ok(ExecutionState::transitioned(next, current, observed));
        }

        if !observed.is_known() {
            current.add_observation(observed)?;
            return Ok(current);
        }

        let suggested = self.lookup(observed.code())?;
        if suggested == current.name() {
            current.add_observation(observed)?;
            return Ok(current);
        }

        if !current.name().can_transition_to(suggested) {
            return Err(MapperError::ForbiddenTransition {
                foreign_state: observed.to_string(),
                from: current.name(),
                to: suggested,
            });
        }

        tracing::debug!(
            execution_id = %current.execution_id(),
            from = %current.name(),
            to = %suggested,
            "execution state transition"
        );
        current.close(observed.clone())?;
        Ok(ExecutionState::transitioned(suggested, current, observed))
    }
}

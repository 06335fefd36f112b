//! The generalized, backend-independent execution state machine

use super::foreign_state::{ForeignState, StateCode};
use crate::common::ids::ExecutionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Names of the generalized execution states every backend maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStateName {
    /// Pre-observation placeholder created at submission time
    Start,
    /// Accepted by the backend, not yet running
    Pending,
    /// Held back by the backend scheduler
    Held,
    /// Running on the backend
    Running,
    /// Suspended by the backend
    Paused,
    /// Ended successfully
    Succeeded,
    /// Ended with a failure attributable to the executed command
    Failed,
    /// Ended because it was canceled
    Canceled,
    /// Ended because the infrastructure failed
    SystemError,
}

impl ExecutionStateName {
    /// Whether this state ends the execution attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStateName::Succeeded
                | ExecutionStateName::Failed
                | ExecutionStateName::Canceled
                | ExecutionStateName::SystemError
        )
    }

    /// String representation of the state name
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStateName::Start => "Start",
            ExecutionStateName::Pending => "Pending",
            ExecutionStateName::Held => "Held",
            ExecutionStateName::Running => "Running",
            ExecutionStateName::Paused => "Paused",
            ExecutionStateName::Succeeded => "Succeeded",
            ExecutionStateName::Failed => "Failed",
            ExecutionStateName::Canceled => "Canceled",
            ExecutionStateName::SystemError => "SystemError",
        }
    }

    /// All state names
    pub fn all() -> &'static [ExecutionStateName] {
        use ExecutionStateName::*;
        &[
            Start, Pending, Held, Running, Paused, Succeeded, Failed, Canceled, SystemError,
        ]
    }

    /// Whether a transition from `self` to `target` is permitted.
    ///
    /// Consults the precomputed transitive closure of the base transition
    /// relation. Terminal states allow no outgoing transitions.
    pub fn can_transition_to(&self, target: ExecutionStateName) -> bool {
        allowed_transitions()
            .get(self)
            .map(|targets| targets.contains(&target))
            .unwrap_or(false)
    }
}

impl fmt::Display for ExecutionStateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Base (single-step) transition relation of the state graph
fn base_transitions() -> Vec<(ExecutionStateName, Vec<ExecutionStateName>)> {
    use ExecutionStateName::*;
    let terminal = vec![Succeeded, Failed, Canceled, SystemError];

    let with_terminal = |mut targets: Vec<ExecutionStateName>| {
        targets.extend(terminal.iter().copied());
        targets
    };

    vec![
        (Start, with_terminal(vec![Pending, Held, Running, Paused])),
        (Pending, with_terminal(vec![Held, Running, Paused])),
        (Held, with_terminal(vec![Pending, Running, Paused])),
        (Running, with_terminal(vec![Paused])),
        (Paused, with_terminal(vec![Running])),
    ]
}

/// Transitive closure of the base relation, computed once.
///
/// Terminal states deliberately get empty target sets: a terminal state is
/// never left, and same-name observations are absorbed before transition
/// validation happens.
fn allowed_transitions() -> &'static HashMap<ExecutionStateName, HashSet<ExecutionStateName>> {
    static CLOSURE: OnceLock<HashMap<ExecutionStateName, HashSet<ExecutionStateName>>> =
        OnceLock::new();
    CLOSURE.get_or_init(|| {
        let mut closure: HashMap<ExecutionStateName, HashSet<ExecutionStateName>> = HashMap::new();
        for name in ExecutionStateName::all() {
            closure.insert(*name, HashSet::new());
        }
        for (from, targets) in base_transitions() {
            closure.get_mut(&from).unwrap().extend(targets);
        }

        // Repeated relational squaring until fixpoint.
        loop {
            let mut changed = false;
            for from in ExecutionStateName::all() {
                let reachable: Vec<ExecutionStateName> =
                    closure[from].iter().copied().collect();
                let mut additions: Vec<ExecutionStateName> = Vec::new();
                for mid in &reachable {
                    for target in &closure[mid] {
                        if !closure[from].contains(target) {
                            additions.push(*target);
                        }
                    }
                }
                if !additions.is_empty() {
                    closure.get_mut(from).unwrap().extend(additions);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        closure
    })
}

/// Execution-state machine violations
#[derive(Debug, Error)]
pub enum StateError {
    /// Observation added after the state was closed
    #[error("Cannot add observation to closed state {state} of execution {execution_id}")]
    ClosedState {
        /// Name of the closed state
        state: ExecutionStateName,
        /// The execution the state belongs to
        execution_id: ExecutionId,
    },

    /// Observation timestamps must be monotonically non-decreasing
    #[error("Out-of-order observation: {observed} is earlier than last observation {last}")]
    OutOfOrderObservation {
        /// Timestamp of the previous observation
        last: DateTime<Utc>,
        /// Timestamp of the rejected observation
        observed: DateTime<Utc>,
    },

    /// Terminal states only accept terminal observations
    #[error("Terminal state {state} rejects non-terminal observation {observation}")]
    NonTerminalObservation {
        /// Name of the terminal state
        state: ExecutionStateName,
        /// Display form of the rejected observation
        observation: String,
    },

    /// The Start placeholder holds no observations
    #[error("Cannot add observation to the Start placeholder of execution {execution_id}")]
    ObservationOnStart {
        /// The execution the state belongs to
        execution_id: ExecutionId,
    },

    /// close() called twice
    #[error("State {state} of execution {execution_id} is already closed")]
    AlreadyClosed {
        /// Name of the state
        state: ExecutionStateName,
        /// The execution the state belongs to
        execution_id: ExecutionId,
    },
}

/// One state of a single process-execution attempt.
///
/// Either the pre-observation `Start` placeholder, or an observed state
/// accumulating [`ForeignState`] observations (latest last) and linking back
/// to the state it transitioned from. Superseded states are sealed with
/// `close()` before the successor takes over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState<S: StateCode> {
    execution_id: ExecutionId,
    name: ExecutionStateName,
    created_at: DateTime<Utc>,
    observations: Vec<ForeignState<S>>,
    closed_by: Option<ForeignState<S>>,
    closed_at: Option<DateTime<Utc>>,
    previous: Option<Box<ExecutionState<S>>>,
}

impl<S: StateCode> ExecutionState<S> {
    /// Create the pre-observation placeholder for a fresh execution attempt
    pub fn start(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            name: ExecutionStateName::Start,
            created_at: Utc::now(),
            observations: Vec::new(),
            closed_by: None,
            closed_at: None,
            previous: None,
        }
    }

    /// Rebuild a state from a persisted snapshot.
    ///
    /// Reconciliation passes reconstruct state from the last persisted
    /// snapshot plus a freshly observed foreign state; the observation list
    /// of the snapshot itself is not retained.
    pub fn resume(
        execution_id: ExecutionId,
        name: ExecutionStateName,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            name,
            created_at,
            observations: Vec::new(),
            closed_by: None,
            closed_at: None,
            previous: None,
        }
    }

    /// Create the successor state reached by `seed`, chaining the closed
    /// predecessor.
    pub(crate) fn transitioned(
        name: ExecutionStateName,
        previous: ExecutionState<S>,
        seed: ForeignState<S>,
    ) -> Self {
        Self {
            execution_id: previous.execution_id,
            name,
            created_at: seed.observed_at(),
            observations: vec![seed],
            closed_by: None,
            closed_at: None,
            previous: Some(Box::new(previous)),
        }
    }

    /// Create a synthetic terminal state for failures that happen before or
    /// during submission, so that callers can treat them uniformly with
    /// post-submission failures.
    pub fn synthetic_failure(
        execution_id: ExecutionId,
        name: ExecutionStateName,
        pid: ProcessIdOrUnknown,
        exit_code: Option<i32>,
        reason: impl Into<String>,
    ) -> Self {
        debug_assert!(name.is_terminal());
        let pid = match pid {
            ProcessIdOrUnknown::Known(pid) => pid,
            ProcessIdOrUnknown::Unknown => crate::ProcessId::new("-", "unsubmitted"),
        };
        let observation =
            ForeignState::terminal(S::not_available(), pid, Utc::now(), vec![reason.into()], exit_code);
        let mut state = Self::start(execution_id);
        state.name = name;
        state.observations.push(observation);
        state
    }

    /// The execution this state belongs to
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Name of this state
    pub fn name(&self) -> ExecutionStateName {
        self.name
    }

    /// When this state was entered
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether this state ends the execution attempt
    pub fn is_terminal(&self) -> bool {
        self.name.is_terminal()
    }

    /// Whether this state has been sealed by a transition
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Time spent in this state so far, or until it was closed
    pub fn lifetime(&self) -> Duration {
        let end = self.closed_at.unwrap_or_else(Utc::now);
        (end - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// All accumulated observations, oldest first
    pub fn observations(&self) -> &[ForeignState<S>] {
        &self.observations
    }

    /// The most recent observation
    pub fn last_observation(&self) -> Option<&ForeignState<S>> {
        self.observations.last()
    }

    /// The backend process id, taken from the most recent observation
    pub fn pid(&self) -> Option<&crate::ProcessId> {
        self.last_observation().map(|obs| obs.pid())
    }

    /// Exit code reported by the most recent terminal observation
    pub fn exit_code(&self) -> Option<i32> {
        self.last_observation().and_then(|obs| obs.exit_code())
    }

    /// The observation that sealed this state, if any
    pub fn closed_by(&self) -> Option<&ForeignState<S>> {
        self.closed_by.as_ref()
    }

    /// The state this one transitioned from, if any
    pub fn previous(&self) -> Option<&ExecutionState<S>> {
        self.previous.as_deref()
    }

    /// Timestamp of the earliest observation of the current contiguous
    /// unknown streak, if the latest observation is unknown.
    pub fn unknown_since(&self) -> Option<DateTime<Utc>> {
        let mut since = None;
        for obs in self.observations.iter().rev() {
            if obs.is_known() {
                break;
            }
            since = Some(obs.observed_at());
        }
        since
    }

    /// Append an observation, enforcing the state-machine invariants.
    ///
    /// On failure the state is left unmodified.
    pub fn add_observation(&mut self, observation: ForeignState<S>) -> Result<(), StateError> {
        if self.name == ExecutionStateName::Start {
            return Err(StateError::ObservationOnStart {
                execution_id: self.execution_id,
            });
        }
        if self.is_closed() {
            return Err(StateError::ClosedState {
                state: self.name,
                execution_id: self.execution_id,
            });
        }
        if let Some(last) = self.observations.last() {
            if observation.observed_at() < last.observed_at() {
                return Err(StateError::OutOfOrderObservation {
                    last: last.observed_at(),
                    observed: observation.observed_at(),
                });
            }
        }
        if self.is_terminal() && !observation.is_terminal() {
            return Err(StateError::NonTerminalObservation {
                state: self.name,
                observation: observation.to_string(),
            });
        }
        self.observations.push(observation);
        Ok(())
    }

    /// Seal this state with the observation that triggered the transition
    /// away from it. No further observations may be added afterwards.
    pub fn close(&mut self, observation: ForeignState<S>) -> Result<(), StateError> {
        if self.is_closed() {
            return Err(StateError::AlreadyClosed {
                state: self.name,
                execution_id: self.execution_id,
            });
        }
        self.closed_at = Some(observation.observed_at());
        self.closed_by = Some(observation);
        Ok(())
    }
}

/// Process id argument for synthetic failure states
#[derive(Debug, Clone)]
pub enum ProcessIdOrUnknown {
    /// The backend assigned an id before the failure
    Known(crate::ProcessId),
    /// The failure happened before any backend id existed
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::super::foreign_state::test_codes::{pid, TestCode};
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn known(code: TestCode, at: DateTime<Utc>) -> ForeignState<TestCode> {
        ForeignState::known(code, pid(), at, vec![])
    }

    #[test]
    fn test_terminal_names() {
        use ExecutionStateName::*;
        for name in [Succeeded, Failed, Canceled, SystemError] {
            assert!(name.is_terminal());
        }
        for name in [Start, Pending, Held, Running, Paused] {
            assert!(!name.is_terminal());
        }
    }

    #[test]
    fn test_closure_contains_base_edges() {
        use ExecutionStateName::*;
        assert!(Start.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Held));
        assert!(Held.can_transition_to(Pending));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(SystemError));
    }

    #[test]
    fn test_closure_contains_multi_step_edges() {
        use ExecutionStateName::*;
        // Start -> Pending -> Held collapses into the closure.
        assert!(Start.can_transition_to(Held));
        // Held -> Running -> Succeeded.
        assert!(Held.can_transition_to(Succeeded));
        // Paused -> Running -> Paused keeps the cycle inside the closure.
        assert!(Paused.can_transition_to(Paused));
    }

    #[test]
    fn test_terminal_states_cannot_be_left() {
        use ExecutionStateName::*;
        for terminal in [Succeeded, Failed, Canceled, SystemError] {
            for target in ExecutionStateName::all() {
                assert!(
                    !terminal.can_transition_to(*target),
                    "{terminal} must not transition to {target}"
                );
            }
        }
    }

    #[test]
    fn test_running_cannot_return_to_pending() {
        use ExecutionStateName::*;
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Held));
        assert!(!Running.can_transition_to(Start));
    }

    #[test]
    fn test_start_holds_no_observations() {
        let mut state: ExecutionState<TestCode> = ExecutionState::start(ExecutionId::new());
        let result = state.add_observation(known(TestCode::Queued, Utc::now()));
        assert!(matches!(result, Err(StateError::ObservationOnStart { .. })));
    }

    #[test]
    fn test_observations_must_be_monotonic() {
        let start: ExecutionState<TestCode> = ExecutionState::start(ExecutionId::new());
        let t0 = Utc::now();
        let mut state =
            ExecutionState::transitioned(ExecutionStateName::Pending, start, known(TestCode::Queued, t0));

        let earlier = t0 - ChronoDuration::seconds(10);
        let result = state.add_observation(known(TestCode::Queued, earlier));
        assert!(matches!(
            result,
            Err(StateError::OutOfOrderObservation { .. })
        ));
        // State unmodified on failure.
        assert_eq!(state.observations().len(), 1);

        // Equal timestamps are fine.
        state.add_observation(known(TestCode::Queued, t0)).unwrap();
        assert_eq!(state.observations().len(), 2);
    }

    #[test]
    fn test_closed_state_rejects_observations() {
        let start: ExecutionState<TestCode> = ExecutionState::start(ExecutionId::new());
        let t0 = Utc::now();
        let mut state =
            ExecutionState::transitioned(ExecutionStateName::Pending, start, known(TestCode::Queued, t0));

        let closing = known(TestCode::Active, t0 + ChronoDuration::seconds(1));
        state.close(closing.clone()).unwrap();
        assert!(state.is_closed());
        assert_eq!(state.closed_by(), Some(&closing));

        let result = state.add_observation(known(TestCode::Active, t0 + ChronoDuration::seconds(2)));
        assert!(matches!(result, Err(StateError::ClosedState { .. })));

        let result = state.close(closing);
        assert!(matches!(result, Err(StateError::AlreadyClosed { .. })));
    }

    #[test]
    fn test_terminal_state_rejects_non_terminal_observation() {
        let start: ExecutionState<TestCode> = ExecutionState::start(ExecutionId::new());
        let t0 = Utc::now();
        let terminal_obs = ForeignState::terminal(TestCode::Done, pid(), t0, vec![], Some(0));
        let mut state =
            ExecutionState::transitioned(ExecutionStateName::Succeeded, start, terminal_obs);

        let result =
            state.add_observation(known(TestCode::Active, t0 + ChronoDuration::seconds(1)));
        assert!(matches!(
            result,
            Err(StateError::NonTerminalObservation { .. })
        ));

        let another_terminal = ForeignState::terminal(
            TestCode::Done,
            pid(),
            t0 + ChronoDuration::seconds(1),
            vec![],
            Some(0),
        );
        state.add_observation(another_terminal).unwrap();
    }

    #[test]
    fn test_unknown_since_tracks_contiguous_streak() {
        let start: ExecutionState<TestCode> = ExecutionState::start(ExecutionId::new());
        let t0 = Utc::now();
        let mut state =
            ExecutionState::transitioned(ExecutionStateName::Running, start, known(TestCode::Active, t0));
        assert!(state.unknown_since().is_none());

        let t1 = t0 + ChronoDuration::seconds(5);
        let t2 = t0 + ChronoDuration::seconds(10);
        state
            .add_observation(ForeignState::unknown(TestCode::NotAvailable, pid(), t1, vec![]))
            .unwrap();
        state
            .add_observation(ForeignState::unknown(TestCode::NotAvailable, pid(), t2, vec![]))
            .unwrap();
        assert_eq!(state.unknown_since(), Some(t1));

        let t3 = t0 + ChronoDuration::seconds(15);
        state.add_observation(known(TestCode::Active, t3)).unwrap();
        assert!(state.unknown_since().is_none());
    }

    #[test]
    fn test_synthetic_failure_is_terminal_with_reason() {
        let state: ExecutionState<TestCode> = ExecutionState::synthetic_failure(
            ExecutionId::new(),
            ExecutionStateName::Failed,
            ProcessIdOrUnknown::Unknown,
            Some(1),
            "working directory does not exist",
        );
        assert!(state.is_terminal());
        assert_eq!(state.exit_code(), Some(1));
        let obs = state.last_observation().unwrap();
        assert!(obs.reasons()[0].contains("working directory"));
    }

    #[test]
    fn test_lifetime_stops_at_close() {
        let start: ExecutionState<TestCode> = ExecutionState::start(ExecutionId::new());
        let t0 = Utc::now() - ChronoDuration::seconds(100);
        let mut state =
            ExecutionState::transitioned(ExecutionStateName::Pending, start, known(TestCode::Queued, t0));
        state
            .close(known(TestCode::Active, t0 + ChronoDuration::seconds(30)))
            .unwrap();
        let lifetime = state.lifetime();
        assert_eq!(lifetime.as_secs(), 30);
    }
}

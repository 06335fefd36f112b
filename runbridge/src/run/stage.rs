//! Run-level lifecycle stages and the externally reported run status
//!
//! A [`ProcessingStage`] describes the run's own coarse lifecycle, distinct
//! from the per-attempt execution state. Stage legality is derived from an
//! explicit transition graph whose transitive closure is computed once;
//! there is no separately maintained ordering that could drift out of sync
//! with the graph.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Coarse lifecycle stage of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStage {
    /// Accepted and persisted, nothing prepared yet
    RunCreated,
    /// Execution environment staged (workdir, attachments)
    PreparedExecution,
    /// Handed to an executor
    SubmittedExecution,
    /// Queued behind the backend scheduler
    AwaitingStart,
    /// The command is running
    StartedExecution,
    /// The command ended; exit code recorded
    FinishedExecution,
    /// Suspended by the backend
    Paused,
    /// A cancel was requested, the backend has not confirmed yet
    RequestedCancel,
    /// Canceled and confirmed ended
    Canceled,
    /// The infrastructure failed
    SystemError,
    /// The executed command failed
    ExecutorError,
}

impl ProcessingStage {
    /// Whether this stage ends the run's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStage::FinishedExecution
                | ProcessingStage::Canceled
                | ProcessingStage::SystemError
                | ProcessingStage::ExecutorError
        )
    }

    /// Whether this stage reports an error condition
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ProcessingStage::SystemError | ProcessingStage::ExecutorError
        )
    }

    /// All stages
    pub fn all() -> &'static [ProcessingStage] {
        use ProcessingStage::*;
        &[
            RunCreated,
            PreparedExecution,
            SubmittedExecution,
            AwaitingStart,
            StartedExecution,
            FinishedExecution,
            Paused,
            RequestedCancel,
            Canceled,
            SystemError,
            ExecutorError,
        ]
    }

    /// Whether progressing from `self` to `target` is legal.
    ///
    /// Staying in place is always legal; leaving a terminal stage never is.
    /// Everything else consults the precomputed closure of the stage graph.
    pub fn allowed_to_progress_to(&self, target: ProcessingStage) -> bool {
        if *self == target {
            return true;
        }
        allowed_progressions()
            .get(self)
            .map(|targets| targets.contains(&target))
            .unwrap_or(false)
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Base (single-step) forward relation: the preparation/execution chain
/// plus the pause/resume cycle
fn base_progressions() -> Vec<(ProcessingStage, Vec<ProcessingStage>)> {
    use ProcessingStage::*;
    vec![
        (RunCreated, vec![PreparedExecution]),
        (PreparedExecution, vec![SubmittedExecution]),
        (SubmittedExecution, vec![AwaitingStart]),
        (AwaitingStart, vec![StartedExecution]),
        (StartedExecution, vec![FinishedExecution, Paused]),
        (Paused, vec![StartedExecution]),
    ]
}

/// Precomputed legality relation.
///
/// The forward chain is transitively closed, so skipping an intermediate
/// stage is legal. The error, cancel, and cancel-retry edges are added
/// *after* closing: they are single-step escapes, and closing over them
/// would make backward progress (`StartedExecution -> SubmittedExecution`
/// through `RequestedCancel`) look legal.
fn allowed_progressions() -> &'static HashMap<ProcessingStage, HashSet<ProcessingStage>> {
    static CLOSURE: OnceLock<HashMap<ProcessingStage, HashSet<ProcessingStage>>> = OnceLock::new();
    CLOSURE.get_or_init(|| {
        let mut closure: HashMap<ProcessingStage, HashSet<ProcessingStage>> = HashMap::new();
        for stage in ProcessingStage::all() {
            closure.insert(*stage, HashSet::new());
        }
        for (from, targets) in base_progressions() {
            closure.get_mut(&from).unwrap().extend(targets);
        }

        loop {
            let mut changed = false;
            for from in ProcessingStage::all() {
                let reachable: Vec<ProcessingStage> = closure[from].iter().copied().collect();
                let mut additions: Vec<ProcessingStage> = Vec::new();
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

        // Errors and cancellation can strike any non-terminal stage.
        for stage in ProcessingStage::all() {
            if !stage.is_terminal() {
                closure.get_mut(stage).unwrap().extend([
                    ProcessingStage::SystemError,
                    ProcessingStage::ExecutorError,
                    ProcessingStage::RequestedCancel,
                ]);
            }
        }
        // Confirming the cancel, or withdrawing it by resubmitting.
        closure
            .get_mut(&ProcessingStage::RequestedCancel)
            .unwrap()
            .extend([
                ProcessingStage::Canceled,
                ProcessingStage::SubmittedExecution,
            ]);
        closure
    })
}

/// Stage-machine violation
#[derive(Debug, Error)]
pub enum StageError {
    /// The requested stage progression is outside the stage graph
    #[error("Illegal processing-stage progression: {from} -> {to}")]
    IllegalProgression {
        /// The stage being left
        from: ProcessingStage,
        /// The requested target stage
        to: ProcessingStage,
    },
}

/// Externally reported run status, derived from the processing stage and
/// the command's exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Accepted, waiting for resources
    Queued,
    /// Being prepared or submitted
    Initializing,
    /// The command is running
    Running,
    /// Suspended
    Paused,
    /// Ended with exit code zero
    Complete,
    /// Ended with a non-zero exit code attributable to the command
    ExecutorError,
    /// Ended because the infrastructure failed
    SystemError,
    /// Cancellation requested, not yet confirmed
    Canceling,
    /// Canceled
    Canceled,
}

impl RunStatus {
    /// Derive the reported status from a stage and the recorded exit code.
    ///
    /// A finished run classifies by exit code: zero is success, positive
    /// codes blame the command, negative (signal deaths) or missing codes
    /// blame the system.
    pub fn from_stage(stage: ProcessingStage, exit_code: Option<i32>) -> RunStatus {
        match stage {
            ProcessingStage::RunCreated => RunStatus::Queued,
            ProcessingStage::PreparedExecution => RunStatus::Initializing,
            ProcessingStage::SubmittedExecution => RunStatus::Initializing,
            ProcessingStage::AwaitingStart => RunStatus::Queued,
            ProcessingStage::StartedExecution => RunStatus::Running,
            ProcessingStage::Paused => RunStatus::Paused,
            ProcessingStage::RequestedCancel => RunStatus::Canceling,
            ProcessingStage::Canceled => RunStatus::Canceled,
            ProcessingStage::SystemError => RunStatus::SystemError,
            ProcessingStage::ExecutorError => RunStatus::ExecutorError,
            ProcessingStage::FinishedExecution => match exit_code {
                Some(0) => RunStatus::Complete,
                Some(code) if code > 0 => RunStatus::ExecutorError,
                _ => RunStatus::SystemError,
            },
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

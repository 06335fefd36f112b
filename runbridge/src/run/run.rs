//! The persisted workflow-run entity
//!
//! In-memory `Run` values are snapshots: they become stale the moment a
//! concurrent writer persists a newer version, which the database layer
//! detects through the `db_version` counter.

use super::request::RunRequest;
use super::stage::{ProcessingStage, RunStatus, StageError};
use crate::common::ids::ExecutionId;
use crate::execution::{ExecutionResult, ExecutionState, ExecutionStateName, StateCode};
use crate::executor::ShellCommand;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Bookkeeping about the run's (single) command execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    /// The command handed to the executor
    pub command: Option<ShellCommand>,
    /// Directory the command ran in
    pub workdir: Option<PathBuf>,
    /// When the command started, per the execution wrapper
    pub start_time: Option<DateTime<Utc>>,
    /// When the command ended, per the execution wrapper
    pub end_time: Option<DateTime<Utc>>,
    /// Exit code of the command
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout_file: Option<PathBuf>,
    /// Captured standard error
    pub stderr_file: Option<PathBuf>,
}

impl ExecutionLog {
    /// Fold a terminal execution result into the log
    pub fn absorb_result(&mut self, result: &ExecutionResult) {
        self.command = Some(result.command.clone());
        self.exit_code = result.exit_code;
        self.start_time = result.start_time;
        self.end_time = result.end_time;
        self.stdout_file = result.stdout_file.clone();
        self.stderr_file = result.stderr_file.clone();
    }
}

/// Snapshot of the latest known execution state, erased of its
/// backend-specific code type so it can be persisted uniformly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLog {
    /// Name of the state
    pub name: ExecutionStateName,
    /// When the state was entered
    pub created_at: DateTime<Utc>,
    /// Whether the state was sealed by a transition
    pub is_closed: bool,
    /// Seconds spent in the state when the snapshot was taken
    pub lifetime_secs: u64,
    /// Hostname of the executor that produced the observation
    pub executor_hostname: String,
    /// Backend process id, rendered as `value@location`
    pub process_id: Option<String>,
    /// Start of the current unknown-observation streak, if any
    pub unknown_since: Option<DateTime<Utc>>,
}

impl StateLog {
    /// Snapshot an execution state
    pub fn of_state<S: StateCode>(state: &ExecutionState<S>, executor_hostname: &str) -> Self {
        Self {
            name: state.name(),
            created_at: state.created_at(),
            is_closed: state.is_closed(),
            lifetime_secs: state.lifetime().as_secs(),
            executor_hostname: executor_hostname.to_string(),
            process_id: state.pid().map(|pid| pid.to_string()),
            unknown_since: state.unknown_since(),
        }
    }
}

/// One persisted workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Stable run identifier
    pub id: Uuid,
    /// Owner of the run
    pub user_id: String,
    /// The request that created the run
    pub request: RunRequest,
    /// When the request was accepted
    pub request_time: DateTime<Utc>,
    /// Current lifecycle stage
    processing_stage: ProcessingStage,
    /// Execution id, assigned at preparation time
    pub execution_id: Option<ExecutionId>,
    /// Command bookkeeping
    pub execution_log: ExecutionLog,
    /// Latest known execution-state snapshot
    pub state_log: Option<StateLog>,
    /// Background-queue task handle reconciling this run, if any
    pub task_id: Option<String>,
    /// Output files, relative to the run directory
    pub outputs: Vec<PathBuf>,
    /// Optimistic-concurrency version counter, owned by the database
    pub db_version: u64,
}

impl Run {
    /// Create a freshly accepted run in stage `RunCreated`
    pub fn new(user_id: impl Into<String>, request: RunRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            request,
            request_time: Utc::now(),
            processing_stage: ProcessingStage::RunCreated,
            execution_id: None,
            execution_log: ExecutionLog::default(),
            state_log: None,
            task_id: None,
            outputs: Vec::new(),
            db_version: 0,
        }
    }

    /// Current lifecycle stage
    pub fn processing_stage(&self) -> ProcessingStage {
        self.processing_stage
    }

    /// Progress to `target`, enforcing stage legality. Progressing to the
    /// current stage is a no-op.
    pub fn progress_to(&mut self, target: ProcessingStage) -> Result<(), StageError> {
        if !self.processing_stage.allowed_to_progress_to(target) {
            return Err(StageError::IllegalProgression {
                from: self.processing_stage,
                to: target,
            });
        }
        if self.processing_stage != target {
            tracing::debug!(
                run_id = %self.id,
                from = %self.processing_stage,
                to = %target,
                "run stage progression"
            );
            self.processing_stage = target;
        }
        Ok(())
    }

    /// The externally reported status
    pub fn status(&self) -> RunStatus {
        RunStatus::from_stage(self.processing_stage, self.execution_log.exit_code)
    }

    /// Whether the run's lifecycle has ended
    pub fn is_finished(&self) -> bool {
        self.processing_stage.is_terminal()
    }

    /// Record the latest execution-state snapshot
    pub fn record_state<S: StateCode>(
        &mut self,
        state: &ExecutionState<S>,
        executor_hostname: &str,
    ) {
        self.state_log = Some(StateLog::of_state(state, executor_hostname));
        if let Some(exit_code) = state.exit_code() {
            self.execution_log.exit_code = Some(exit_code);
        }
    }

    /// Record the terminal execution result
    pub fn record_result(&mut self, result: &ExecutionResult) {
        self.execution_log.absorb_result(result);
    }
}

//! Backend executor capability and its implementations
//!
//! An [`Executor`] submits a [`ShellCommand`] to one compute backend,
//! observes it as [`ForeignState`](crate::execution::ForeignState) values,
//! and maps those onto the generalized
//! [`ExecutionState`](crate::execution::ExecutionState) machine.

mod command;
pub mod cluster;
pub mod kubernetes;
pub mod local;
mod shell;
pub mod ssh;
pub mod unix;
mod wrapper;

pub use command::{quote, ExecutionSettings, ShellCommand};
pub use shell::{CommandOutput, LocalRunner, ShellRunner, SshRunner, SshTarget};
pub use wrapper::{env_file_content, wrapper_script};

use crate::common::ids::{ExecutionId, ProcessId};
use crate::execution::{
    ExecutionResult, ExecutionState, ForeignState, MapperError, SimpleStateMapper, StateCode,
};
use crate::storage::{StorageAccessor, StorageError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised at the executor boundary.
///
/// Backend-specific failures (subprocess errors, connection drops, cluster
/// tool output) are caught inside each executor and re-raised as one of
/// these; nothing backend-specific leaks past this interface.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Submission to the backend failed
    #[error("Submission failed: {reason}")]
    Submission {
        /// Why the submission failed
        reason: String,
    },

    /// The backend's output violated its protocol (no unique status line,
    /// job id mismatch). Fatal, never retried.
    #[error("Backend protocol violation: {reason}")]
    Protocol {
        /// What was violated
        reason: String,
    },

    /// A backend command exited unsuccessfully
    #[error("Command failed with exit code {exit_code:?}: {command}\n{stderr}")]
    CommandFailed {
        /// The command that failed
        command: String,
        /// The exit code, if the process exited at all
        exit_code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Connection-class failure talking to a remote backend
    #[error("Connection failure: {reason}")]
    Connection {
        /// What went wrong
        reason: String,
    },

    /// The operation requires a terminal state
    #[error("Execution {execution_id} is not in a terminal state (currently {state})")]
    NotTerminal {
        /// The execution in question
        execution_id: ExecutionId,
        /// The current, non-terminal state name
        state: String,
    },

    /// The operation requires a backend process id
    #[error("No backend process id known for execution {execution_id}")]
    MissingProcessId {
        /// The execution in question
        execution_id: ExecutionId,
    },

    /// State-mapper failure while generalizing an observation
    #[error(transparent)]
    Mapper(#[from] MapperError),

    /// Storage failure while staging or collecting files
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Whether this error is worth another attempt (transient
    /// backend-communication failures are; protocol violations are not).
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::Connection { .. })
    }
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Signal to deliver with [`Executor::kill`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Polite termination request
    Term,
    /// Interrupt
    Int,
    /// Forceful kill
    Kill,
}

impl KillSignal {
    /// Signal name as understood by `kill -s` and cluster kill commands
    pub fn name(&self) -> &'static str {
        match self {
            KillSignal::Term => "TERM",
            KillSignal::Int => "INT",
            KillSignal::Kill => "KILL",
        }
    }
}

/// Well-known file layout of one execution's log directory.
///
/// The wrapper script writes its process id, timestamps, and exit code into
/// this directory, so that status and results can be recovered by any later
/// process, not just the one that submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPaths {
    /// Directory the command runs in
    pub workdir: PathBuf,
    /// Directory holding wrapper, redirection and bookkeeping files
    pub log_dir: PathBuf,
}

impl ExecutionPaths {
    /// Create a path layout from a working directory and a log directory
    pub fn new(workdir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            log_dir: log_dir.into(),
        }
    }

    /// The wrapper script staged for this execution
    pub fn wrapper_file(&self) -> PathBuf {
        self.log_dir.join("wrapper.sh")
    }

    /// Environment file sourced by the wrapper
    pub fn env_file(&self) -> PathBuf {
        self.log_dir.join("env.sh")
    }

    /// Captured standard output
    pub fn stdout_file(&self) -> PathBuf {
        self.log_dir.join("stdout")
    }

    /// Captured standard error
    pub fn stderr_file(&self) -> PathBuf {
        self.log_dir.join("stderr")
    }

    /// Standard input fed to the command, if staged
    pub fn stdin_file(&self) -> PathBuf {
        self.log_dir.join("stdin")
    }

    /// Process id of the wrapper, written by the wrapper itself
    pub fn pid_file(&self) -> PathBuf {
        self.log_dir.join("pid")
    }

    /// Backend-native job id, written after cluster submission
    pub fn job_id_file(&self) -> PathBuf {
        self.log_dir.join("job_id")
    }

    /// Exit code of the command, written by the wrapper on completion
    pub fn exit_code_file(&self) -> PathBuf {
        self.log_dir.join("exit_code")
    }

    /// ISO-8601 start timestamp written by the wrapper
    pub fn start_time_file(&self) -> PathBuf {
        self.log_dir.join("start_time")
    }

    /// ISO-8601 end timestamp written by the wrapper
    pub fn end_time_file(&self) -> PathBuf {
        self.log_dir.join("end_time")
    }
}

/// Read one of the wrapper's timestamp files, tolerating its absence.
pub(crate) async fn read_timestamp(
    storage: &dyn StorageAccessor,
    path: &std::path::Path,
) -> Option<chrono::DateTime<chrono::Utc>> {
    let content = storage.read_to_string(path).await.ok()?;
    chrono::DateTime::parse_from_str(content.trim(), "%Y-%m-%dT%H:%M:%S%z")
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

/// Read the wrapper's exit-code file, tolerating its absence.
pub(crate) async fn read_exit_code(
    storage: &dyn StorageAccessor,
    paths: &ExecutionPaths,
) -> ExecutorResult<Option<i32>> {
    match storage.read_to_string(&paths.exit_code_file()).await {
        Ok(content) => Ok(content.trim().parse::<i32>().ok()),
        Err(StorageError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Shared `get_result` implementation: collect log-directory bookkeeping
/// files into an [`ExecutionResult`] for a terminal state.
pub(crate) async fn collect_result<S: StateCode>(
    storage: &dyn StorageAccessor,
    state: &ExecutionState<S>,
    command: &ShellCommand,
    paths: &ExecutionPaths,
) -> ExecutorResult<ExecutionResult> {
    if !state.is_terminal() {
        return Err(ExecutorError::NotTerminal {
            execution_id: state.execution_id(),
            state: state.name().to_string(),
        });
    }
    let stdin_file = if storage.exists(&paths.stdin_file()).await? {
        Some(paths.stdin_file())
    } else {
        None
    };
    Ok(ExecutionResult {
        command: command.clone(),
        state_name: state.name(),
        process_id: state.pid().cloned(),
        exit_code: state.exit_code(),
        stdout_file: Some(paths.stdout_file()),
        stderr_file: Some(paths.stderr_file()),
        stdin_file,
        start_time: read_timestamp(storage, &paths.start_time_file()).await,
        end_time: read_timestamp(storage, &paths.end_time_file()).await,
    })
}

/// Capability contract for submitting, observing, and ending command
/// executions on one compute backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The backend's closed state-code enumeration
    type Code: StateCode;

    /// Hostname or label of the infrastructure this executor submits to
    fn hostname(&self) -> String;

    /// The storage this executor stages files through
    fn storage(&self) -> Arc<dyn StorageAccessor>;

    /// The mapper generalizing this backend's observations
    fn mapper(&self) -> &SimpleStateMapper<Self::Code>;

    /// Submit `command` for execution.
    ///
    /// Idempotent with respect to `execution_id`: resubmission with the
    /// same id must not be double-charged against the backend. Submission
    /// failures caused by unavailable resources are returned as synthetic
    /// terminal states, not as errors, so callers can treat them uniformly
    /// with post-submission failures.
    async fn execute(
        &self,
        execution_id: &ExecutionId,
        command: &ShellCommand,
        paths: &ExecutionPaths,
        settings: &ExecutionSettings,
    ) -> ExecutorResult<ExecutionState<Self::Code>>;

    /// Observe the backend's current state for this execution.
    ///
    /// Read-only; never mutates prior execution state. Returns `None` when
    /// nothing could be determined and the caller should decide whether to
    /// retry or treat the situation as recoverable-unknown.
    async fn get_status(
        &self,
        execution_id: &ExecutionId,
        paths: &ExecutionPaths,
        pid: Option<&ProcessId>,
    ) -> ExecutorResult<Option<ForeignState<Self::Code>>>;

    /// Observe the backend and fold the observation into `current`.
    ///
    /// Returns the (possibly unchanged) state; when nothing could be
    /// observed the state passes through untouched.
    async fn update_status(
        &self,
        current: ExecutionState<Self::Code>,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<ExecutionState<Self::Code>> {
        let pid = current.pid().cloned();
        let observed = self
            .get_status(&current.execution_id(), paths, pid.as_ref())
            .await?;
        match observed {
            Some(observation) => Ok(self.mapper().transition(current, observation)?),
            None => Ok(current),
        }
    }

    /// Produce the final result of a terminal execution state
    async fn get_result(
        &self,
        state: &ExecutionState<Self::Code>,
        command: &ShellCommand,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<ExecutionResult>;

    /// Best-effort kill.
    ///
    /// Returns `true` when the signal was delivered or the process was
    /// already gone; never fails merely because the target already ended.
    async fn kill(
        &self,
        state: &ExecutionState<Self::Code>,
        signal: KillSignal,
    ) -> ExecutorResult<bool>;

    /// Block until the backend process ends, using the most efficient
    /// backend-native primitive available. This is the one call expected
    /// to suspend for a long time.
    async fn wait(
        &self,
        state: &ExecutionState<Self::Code>,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<()>;
}

//! Final result of one terminal execution attempt

use crate::common::ids::ProcessId;
use crate::execution::ExecutionStateName;
use crate::executor::ShellCommand;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Summary of a finished execution attempt.
///
/// Only meaningful once the execution state is terminal; produced by
/// `Executor::get_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The command that was executed
    pub command: ShellCommand,
    /// Name of the terminal state the attempt ended in
    pub state_name: ExecutionStateName,
    /// Backend-native process identifier, if the submission succeeded
    pub process_id: Option<ProcessId>,
    /// Exit code of the command, if the backend reported one
    pub exit_code: Option<i32>,
    /// Reference to the captured standard output
    pub stdout_file: Option<PathBuf>,
    /// Reference to the captured standard error
    pub stderr_file: Option<PathBuf>,
    /// Reference to the standard input that was fed to the command
    pub stdin_file: Option<PathBuf>,
    /// When the command started, as recorded by the execution wrapper
    pub start_time: Option<DateTime<Utc>>,
    /// When the command ended, as recorded by the execution wrapper
    pub end_time: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    /// Whether the attempt ended successfully with exit code zero
    pub fn succeeded(&self) -> bool {
        self.state_name == ExecutionStateName::Succeeded && self.exit_code == Some(0)
    }
}

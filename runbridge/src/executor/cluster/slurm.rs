//! Slurm command set: `sbatch`, `sacct`, `scancel`

use super::{CommandSet, JobStatusLine};
use crate::execution::{ExecutionStateName, SimpleStateMapper, StateCode};
use crate::executor::{
    ExecutionPaths, ExecutionSettings, ExecutorError, ExecutorResult, KillSignal, ShellCommand,
};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// Slurm job states as reported by `sacct`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlurmState {
    /// `PENDING`: waiting for resources
    Pending,
    /// `CONFIGURING`: resources granted, nodes booting
    Configuring,
    /// `RUNNING`: running
    Running,
    /// `COMPLETING`: finishing up, epilog running
    Completing,
    /// `SUSPENDED`: suspended, resources released
    Suspended,
    /// `REQUEUED`: put back into the queue
    Requeued,
    /// `RESIZING`: allocation being changed
    Resizing,
    /// `COMPLETED`: finished with exit code zero
    Completed,
    /// `FAILED`: finished with a non-zero exit code
    Failed,
    /// `CANCELLED`: canceled by a user or administrator
    Cancelled,
    /// `TIMEOUT`: hit its walltime limit
    Timeout,
    /// `OUT_OF_MEMORY`: killed by the OOM handler
    OutOfMemory,
    /// `DEADLINE`: missed its deadline
    Deadline,
    /// `PREEMPTED`: preempted by another job
    Preempted,
    /// `NODE_FAIL`: the allocated node failed
    NodeFail,
    /// `BOOT_FAIL`: the allocated node failed to boot
    BootFail,
    /// `REVOKED`: sibling job removed by fed-job arbitration
    Revoked,
    /// Nothing could be determined
    NotAvailable,
}

impl fmt::Display for SlurmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            SlurmState::Pending => "PENDING",
            SlurmState::Configuring => "CONFIGURING",
            SlurmState::Running => "RUNNING",
            SlurmState::Completing => "COMPLETING",
            SlurmState::Suspended => "SUSPENDED",
            SlurmState::Requeued => "REQUEUED",
            SlurmState::Resizing => "RESIZING",
            SlurmState::Completed => "COMPLETED",
            SlurmState::Failed => "FAILED",
            SlurmState::Cancelled => "CANCELLED",
            SlurmState::Timeout => "TIMEOUT",
            SlurmState::OutOfMemory => "OUT_OF_MEMORY",
            SlurmState::Deadline => "DEADLINE",
            SlurmState::Preempted => "PREEMPTED",
            SlurmState::NodeFail => "NODE_FAIL",
            SlurmState::BootFail => "BOOT_FAIL",
            SlurmState::Revoked => "REVOKED",
            SlurmState::NotAvailable => "NOT_AVAILABLE",
        };
        write!(f, "{}", word)
    }
}

impl StateCode for SlurmState {
    /// Accepts the bare state word; suffixes like `CANCELLED by 1234` are
    /// stripped by the status parser before reaching here.
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("PENDING") => SlurmState::Pending,
            Some("CONFIGURING") => SlurmState::Configuring,
            Some("RUNNING") => SlurmState::Running,
            Some("COMPLETING") => SlurmState::Completing,
            Some("SUSPENDED") => SlurmState::Suspended,
            Some("REQUEUED") => SlurmState::Requeued,
            Some("RESIZING") => SlurmState::Resizing,
            Some("COMPLETED") => SlurmState::Completed,
            Some("FAILED") => SlurmState::Failed,
            Some("CANCELLED") => SlurmState::Cancelled,
            Some("TIMEOUT") => SlurmState::Timeout,
            Some("OUT_OF_MEMORY") => SlurmState::OutOfMemory,
            Some("DEADLINE") => SlurmState::Deadline,
            Some("PREEMPTED") => SlurmState::Preempted,
            Some("NODE_FAIL") => SlurmState::NodeFail,
            Some("BOOT_FAIL") => SlurmState::BootFail,
            Some("REVOKED") => SlurmState::Revoked,
            _ => SlurmState::NotAvailable,
        }
    }

    fn not_available() -> Self {
        SlurmState::NotAvailable
    }

    fn is_terminal_code(&self) -> bool {
        matches!(
            self,
            SlurmState::Completed
                | SlurmState::Failed
                | SlurmState::Cancelled
                | SlurmState::Timeout
                | SlurmState::OutOfMemory
                | SlurmState::Deadline
                | SlurmState::Preempted
                | SlurmState::NodeFail
                | SlurmState::BootFail
                | SlurmState::Revoked
        )
    }

    fn is_unknown_code(&self) -> bool {
        matches!(self, SlurmState::NotAvailable)
    }

    fn is_success_code(&self) -> bool {
        matches!(self, SlurmState::Completed)
    }
}

/// `sbatch` prints `Submitted batch job 1234`
fn job_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Submitted batch job (\d+)").expect("static regex"))
}

/// Split sacct's `ExitCode` column, formatted `rc:signal`. A job ended by
/// a signal reports the signal number negated, matching the shell's
/// convention of 128+N being visible as the wait status.
fn parse_exit_code(field: &str) -> Option<i32> {
    let mut parts = field.splitn(2, ':');
    let rc = parts.next()?.parse::<i32>().ok()?;
    let signal = parts.next().and_then(|s| s.parse::<i32>().ok()).unwrap_or(0);
    if signal != 0 {
        Some(-signal)
    } else {
        Some(rc)
    }
}

/// Command set for Slurm clusters
#[derive(Debug, Clone, Default)]
pub struct SlurmCommandSet;

impl SlurmCommandSet {
    /// Create the Slurm command set
    pub fn new() -> Self {
        Self
    }
}

impl CommandSet for SlurmCommandSet {
    type Code = SlurmState;

    fn name(&self) -> &'static str {
        "Slurm"
    }

    fn submitted_code(&self) -> SlurmState {
        SlurmState::Pending
    }

    fn state_mapper(&self) -> SimpleStateMapper<SlurmState> {
        use ExecutionStateName::*;
        SimpleStateMapper::new(HashMap::from([
            (SlurmState::Pending, Pending),
            (SlurmState::Configuring, Pending),
            (SlurmState::Requeued, Pending),
            (SlurmState::Running, Running),
            (SlurmState::Completing, Running),
            (SlurmState::Resizing, Running),
            (SlurmState::Suspended, Paused),
            (SlurmState::Completed, Succeeded),
            (SlurmState::Failed, Failed),
            (SlurmState::Timeout, Failed),
            (SlurmState::OutOfMemory, Failed),
            (SlurmState::Deadline, Failed),
            (SlurmState::Cancelled, Canceled),
            (SlurmState::Preempted, Canceled),
            (SlurmState::NodeFail, SystemError),
            (SlurmState::BootFail, SystemError),
            (SlurmState::Revoked, SystemError),
        ]))
    }

    fn submit_command(
        &self,
        wrapper: &Path,
        paths: &ExecutionPaths,
        settings: &ExecutionSettings,
    ) -> ShellCommand {
        let mut command = ShellCommand::new("sbatch")
            .arg("--chdir")
            .arg(paths.workdir.to_string_lossy())
            .arg("--output")
            .arg(paths.log_dir.join("scheduler_stdout").to_string_lossy())
            .arg("--error")
            .arg(paths.log_dir.join("scheduler_stderr").to_string_lossy());
        if let Some(name) = &settings.job_name {
            command = command.arg("--job-name").arg(name);
        }
        if let Some(queue) = &settings.queue {
            command = command.arg("--partition").arg(queue);
        }
        if let Some(account) = &settings.accounting_name {
            command = command.arg("--account").arg(account);
        }
        if let Some(minutes) = settings.walltime_minutes() {
            command = command.arg("--time").arg(minutes.to_string());
        }
        if let Some(memory_kib) = settings.memory_kib {
            let mb = memory_kib.div_ceil(1024);
            command = command.arg("--mem").arg(format!("{}M", mb));
        }
        if let Some(cores) = settings.cores() {
            command = command.arg("--cpus-per-task").arg(cores.to_string());
        }
        command
            .arg(format!("--wrap=/bin/sh {}", wrapper.to_string_lossy()))
    }

    fn parse_job_id(&self, stdout: &str) -> ExecutorResult<String> {
        job_id_pattern()
            .captures(stdout)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| ExecutorError::Protocol {
                reason: format!("no job id in sbatch output: {:?}", stdout.trim()),
            })
    }

    fn finished_code(&self, exit_code: i32) -> SlurmState {
        if exit_code == 0 {
            SlurmState::Completed
        } else {
            SlurmState::Failed
        }
    }

    fn status_command(&self, job_id: &str) -> ShellCommand {
        ShellCommand::new("sacct")
            .arg("--jobs")
            .arg(job_id)
            .arg("--format=JobID,State,ExitCode")
            .arg("--noheader")
            .arg("--parsable2")
    }

    /// The line whose JobID equals the queried id verbatim is the job
    /// itself; `.batch` and `.extern` step lines are skipped.
    fn parse_status(&self, stdout: &str, job_id: &str) -> ExecutorResult<Option<JobStatusLine>> {
        let mut found: Option<JobStatusLine> = None;
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() < 3 {
                return Err(ExecutorError::Protocol {
                    reason: format!("malformed sacct line: {:?}", line),
                });
            }
            if fields[0] != job_id {
                continue;
            }
            if found.is_some() {
                return Err(ExecutorError::Protocol {
                    reason: format!("multiple sacct lines for job {}", job_id),
                });
            }
            // "CANCELLED by 1234" carries the canceling uid as a suffix.
            let mut words = fields[1].split_whitespace();
            let state = words.next().unwrap_or("").to_string();
            // A word sacct should never emit is a violated output
            // contract, not an unknown observation.
            if SlurmState::parse(Some(state.as_str())).is_unknown_code() {
                return Err(ExecutorError::Protocol {
                    reason: format!("invalid sacct state word: {:?}", fields[1]),
                });
            }
            let reasons = if fields[1].len() > state.len() {
                vec![fields[1].to_string()]
            } else {
                vec![]
            };
            found = Some(JobStatusLine {
                job_id: fields[0].to_string(),
                state: Some(state),
                exit_code: parse_exit_code(fields[2]),
                reasons,
            });
        }
        Ok(found)
    }

    fn kill_command(&self, job_id: &str, signal: KillSignal) -> ShellCommand {
        ShellCommand::new("scancel")
            .arg("--signal")
            .arg(signal.name())
            .arg("--full")
            .arg(job_id)
    }

    fn kill_means_gone(&self, stderr: &str) -> bool {
        stderr.contains("Invalid job id specified")
            || stderr.contains("already completing or completed")
    }

    fn wait_command(&self, _job_id: &str) -> Option<ShellCommand> {
        // No blocking wait tool; the executor falls back to polling.
        None
    }
}

//! Cluster executors driving batch schedulers through their command-line
//! tools
//!
//! [`ClusterExecutor`] contains everything the schedulers have in common:
//! staging the wrapper, idempotent submission keyed on the `job_id` file,
//! status observation, kill, and wait. The scheduler-specific command
//! lines and output parsing live behind [`CommandSet`], with one
//! implementation per scheduler. The executor composes a [`ShellRunner`],
//! so the same code submits from the local host or through SSH.

pub mod lsf;
pub mod slurm;

pub use lsf::{LsfCommandSet, LsfState};
pub use slurm::{SlurmCommandSet, SlurmState};

use super::wrapper::{env_file_content, wrapper_script};
use super::{
    collect_result, ExecutionPaths, ExecutionSettings, Executor, ExecutorError, ExecutorResult,
    KillSignal, ShellCommand, ShellRunner,
};
use crate::common::ids::{ExecutionId, ProcessId};
use crate::common::retry::RetryPolicy;
use crate::execution::{
    ExecutionResult, ExecutionState, ExecutionStateName, ForeignState, ProcessIdOrUnknown,
    SimpleStateMapper, StateCode,
};
use crate::storage::{StorageAccessor, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Polling interval for `wait` on schedulers without a blocking wait tool
const STATUS_POLL: Duration = Duration::from_secs(5);

/// One job's worth of parsed scheduler status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusLine {
    /// Scheduler-native job id
    pub job_id: String,
    /// Raw scheduler state word, if the scheduler reported one
    pub state: Option<String>,
    /// Exit code, if the scheduler reported one
    pub exit_code: Option<i32>,
    /// Free-text annotations, e.g. who canceled the job
    pub reasons: Vec<String>,
}

/// Scheduler-specific command lines and output parsing.
///
/// Parsers return [`ExecutorError::Protocol`] when the tool's output shape
/// is violated (no job id in the submission banner, more than one status
/// line for a single job id); unrecognized state words are left to the
/// code's total `parse` and end up as unknown observations instead.
pub trait CommandSet: Send + Sync + 'static {
    /// The scheduler's state-code enumeration
    type Code: StateCode;

    /// Human-readable scheduler name, used in logs and labels
    fn name(&self) -> &'static str;

    /// The state a freshly accepted job is in, used to seed the execution
    /// state without an immediate status round-trip
    fn submitted_code(&self) -> Self::Code;

    /// Mapper from scheduler states onto the generalized state machine
    fn state_mapper(&self) -> SimpleStateMapper<Self::Code>;

    /// Submission command for a staged wrapper script
    fn submit_command(
        &self,
        wrapper: &Path,
        paths: &ExecutionPaths,
        settings: &ExecutionSettings,
    ) -> ShellCommand;

    /// Extract the job id from the submission tool's stdout
    fn parse_job_id(&self, stdout: &str) -> ExecutorResult<String>;

    /// Terminal state word for a job the scheduler has already purged,
    /// classified by the wrapper's recorded exit code
    fn finished_code(&self, exit_code: i32) -> Self::Code;

    /// Status query for one job id
    fn status_command(&self, job_id: &str) -> ShellCommand;

    /// Parse the status tool's stdout; `None` when the scheduler no longer
    /// knows the job
    fn parse_status(&self, stdout: &str, job_id: &str) -> ExecutorResult<Option<JobStatusLine>>;

    /// Kill command for one job id
    fn kill_command(&self, job_id: &str, signal: KillSignal) -> ShellCommand;

    /// Whether a failed kill's stderr means the job was already gone
    fn kill_means_gone(&self, stderr: &str) -> bool;

    /// Blocking wait command, if the scheduler has one; `None` falls back
    /// to status polling
    fn wait_command(&self, job_id: &str) -> Option<ShellCommand>;
}

/// Executor submitting to a batch scheduler
pub struct ClusterExecutor<C: CommandSet> {
    command_set: C,
    runner: Arc<dyn ShellRunner>,
    storage: Arc<dyn StorageAccessor>,
    mapper: SimpleStateMapper<C::Code>,
    retry: RetryPolicy,
}

impl<C: CommandSet> ClusterExecutor<C> {
    /// Create a cluster executor submitting through `runner` and staging
    /// files through `storage`. Runner and storage must address the same
    /// host. `retry` bounds the backoff applied to transient status-query
    /// failures, typically [`Config::status_retry_policy`].
    ///
    /// [`Config::status_retry_policy`]: crate::Config::status_retry_policy
    pub fn new(
        command_set: C,
        runner: Arc<dyn ShellRunner>,
        storage: Arc<dyn StorageAccessor>,
        retry: RetryPolicy,
    ) -> Self {
        let mapper = command_set.state_mapper();
        Self {
            command_set,
            runner,
            storage,
            mapper,
            retry,
        }
    }

    fn job_process_id(&self, job_id: &str) -> ProcessId {
        ProcessId::new(job_id, self.hostname())
    }

    async fn read_job_id(&self, paths: &ExecutionPaths) -> ExecutorResult<Option<String>> {
        match self.storage.read_to_string(&paths.job_id_file()).await {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn observe(
        &self,
        paths: &ExecutionPaths,
        job_id: &str,
    ) -> ExecutorResult<ForeignState<C::Code>> {
        let pid = self.job_process_id(job_id);
        let command = self.command_set.status_command(job_id);
        // Status tools fail transiently (scheduler restarts, accounting
        // lag); retry with backoff, and only an exhausted retry budget
        // degrades to an unknown observation instead of erroring the poll
        // loop.
        let attempt = self
            .retry
            .retry(ExecutorError::is_transient, || async {
                let output = self.runner.run(&command).await?;
                if output.succeeded() {
                    Ok(output)
                } else {
                    Err(ExecutorError::Connection {
                        reason: format!(
                            "{} status query failed: {}",
                            self.command_set.name(),
                            output.stderr.trim()
                        ),
                    })
                }
            })
            .await;
        let output = match attempt {
            Ok(output) => output,
            Err(e @ ExecutorError::Connection { .. }) => {
                return Ok(ForeignState::unknown(
                    C::Code::not_available(),
                    pid,
                    Utc::now(),
                    vec![e.to_string()],
                ));
            }
            Err(e) => return Err(e),
        };
        match self.command_set.parse_status(&output.stdout, job_id)? {
            Some(line) => {
                // The scheduler may report no exit code for finished jobs;
                // the wrapper's exit file is authoritative in that case.
                let exit_code = match line.exit_code {
                    Some(code) => Some(code),
                    None => super::read_exit_code(self.storage.as_ref(), paths).await?,
                };
                Ok(C::Code::as_foreign_state(
                    pid,
                    line.state.as_deref(),
                    exit_code,
                    Utc::now(),
                    line.reasons,
                ))
            }
            None => {
                // Job purged from the scheduler's bookkeeping. The wrapper's
                // exit file still tells us how it ended.
                match super::read_exit_code(self.storage.as_ref(), paths).await? {
                    Some(exit_code) => Ok(self
                        .command_set
                        .finished_code(exit_code)
                        .into_foreign_state(pid, Some(exit_code), Utc::now(), vec![])),
                    None => Ok(ForeignState::unknown(
                        C::Code::not_available(),
                        pid,
                        Utc::now(),
                        vec![format!(
                            "job {} not known to {}",
                            job_id,
                            self.command_set.name()
                        )],
                    )),
                }
            }
        }
    }
}

#[async_trait]
impl<C: CommandSet> Executor for ClusterExecutor<C> {
    type Code = C::Code;

    fn hostname(&self) -> String {
        self.runner.location()
    }

    fn storage(&self) -> Arc<dyn StorageAccessor> {
        self.storage.clone()
    }

    fn mapper(&self) -> &SimpleStateMapper<C::Code> {
        &self.mapper
    }

    async fn execute(
        &self,
        execution_id: &ExecutionId,
        command: &ShellCommand,
        paths: &ExecutionPaths,
        settings: &ExecutionSettings,
    ) -> ExecutorResult<ExecutionState<C::Code>> {
        if !self.storage.exists(&paths.workdir).await? {
            return Ok(ExecutionState::synthetic_failure(
                *execution_id,
                ExecutionStateName::Failed,
                ProcessIdOrUnknown::Unknown,
                Some(1),
                format!("working directory {} does not exist", paths.workdir.display()),
            ));
        }
        self.storage.create_dir(&paths.log_dir).await?;

        // Idempotent resubmission: the job_id file is written right after
        // the scheduler accepted the job, so its presence means the job
        // must not be submitted again.
        if let Some(job_id) = self.read_job_id(paths).await? {
            tracing::info!(
                execution_id = %execution_id,
                job_id = %job_id,
                scheduler = self.command_set.name(),
                "recovering previously submitted cluster job"
            );
            let observed = self.observe(paths, &job_id).await?;
            let state = ExecutionState::start(*execution_id);
            return Ok(self.mapper.transition(state, observed)?);
        }

        self.storage
            .put_bytes(
                env_file_content(execution_id, command).as_bytes(),
                &paths.env_file(),
            )
            .await?;
        let with_stdin = self.storage.exists(&paths.stdin_file()).await?;
        self.storage
            .put_bytes(
                wrapper_script(command, paths, with_stdin).as_bytes(),
                &paths.wrapper_file(),
            )
            .await?;

        let submit = self
            .command_set
            .submit_command(&paths.wrapper_file(), paths, settings);
        let output = self.runner.run(&submit).await?;
        if !output.succeeded() {
            // Rejected submissions (bad queue, exhausted quota) end the
            // attempt; callers handle them like any other failure.
            return Ok(ExecutionState::synthetic_failure(
                *execution_id,
                ExecutionStateName::SystemError,
                ProcessIdOrUnknown::Unknown,
                None,
                format!(
                    "{} submission failed: {}",
                    self.command_set.name(),
                    output.stderr.trim()
                ),
            ));
        }
        let job_id = self.command_set.parse_job_id(&output.stdout)?;
        self.storage
            .put_bytes(format!("{}\n", job_id).as_bytes(), &paths.job_id_file())
            .await?;
        tracing::info!(
            execution_id = %execution_id,
            job_id = %job_id,
            scheduler = self.command_set.name(),
            "submitted cluster job"
        );

        let accepted = ForeignState::known(
            self.command_set.submitted_code(),
            self.job_process_id(&job_id),
            Utc::now(),
            vec![],
        );
        let state = ExecutionState::start(*execution_id);
        Ok(self.mapper.transition(state, accepted)?)
    }

    async fn get_status(
        &self,
        _execution_id: &ExecutionId,
        paths: &ExecutionPaths,
        pid: Option<&ProcessId>,
    ) -> ExecutorResult<Option<ForeignState<C::Code>>> {
        let job_id = match pid {
            Some(pid) => Some(pid.value.clone()),
            None => self.read_job_id(paths).await?,
        };
        let Some(job_id) = job_id else {
            return Ok(None);
        };
        Ok(Some(self.observe(paths, &job_id).await?))
    }

    async fn get_result(
        &self,
        state: &ExecutionState<C::Code>,
        command: &ShellCommand,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<ExecutionResult> {
        collect_result(self.storage.as_ref(), state, command, paths).await
    }

    async fn kill(
        &self,
        state: &ExecutionState<C::Code>,
        signal: KillSignal,
    ) -> ExecutorResult<bool> {
        if state.is_terminal() {
            return Ok(true);
        }
        let Some(pid) = state.pid() else {
            return Err(ExecutorError::MissingProcessId {
                execution_id: state.execution_id(),
            });
        };
        let command = self.command_set.kill_command(&pid.value, signal);
        let output = self.runner.run(&command).await?;
        if output.succeeded() {
            return Ok(true);
        }
        Ok(self.command_set.kill_means_gone(&output.stderr))
    }

    async fn wait(
        &self,
        state: &ExecutionState<C::Code>,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<()> {
        if state.is_terminal() {
            return Ok(());
        }
        let Some(pid) = state.pid() else {
            return Err(ExecutorError::MissingProcessId {
                execution_id: state.execution_id(),
            });
        };
        if let Some(wait) = self.command_set.wait_command(&pid.value) {
            let output = self.runner.run(&wait).await?;
            if output.succeeded() {
                return Ok(());
            }
            // Fall through to polling; the wait tool also fails when the
            // job finished before it started watching.
        }
        loop {
            if super::read_exit_code(self.storage.as_ref(), paths)
                .await?
                .is_some()
            {
                return Ok(());
            }
            let observed = self.observe(paths, &pid.value).await?;
            if observed.is_terminal() {
                return Ok(());
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
    }
}

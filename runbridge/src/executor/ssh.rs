//! Executor running commands on an SSH-reachable host
//!
//! The remote host is treated exactly like the local one: the same wrapper
//! script and log-directory bookkeeping, the same `/proc` observations,
//! only transported through the `ssh` client. Connection-class failures
//! are retried by the shared runner; the remote command's own failure is
//! never retried.

use super::unix::{unix_state_mapper, UnixProcState};
use super::wrapper::{env_file_content, wrapper_script};
use super::{
    collect_result, quote, read_exit_code, ExecutionPaths, ExecutionSettings, Executor,
    ExecutorError, ExecutorResult, KillSignal, ShellCommand, ShellRunner, SshRunner, SshTarget,
};
use crate::common::ids::{ExecutionId, ProcessId};
use crate::common::retry::RetryPolicy;
use crate::execution::{
    ExecutionResult, ExecutionState, ExecutionStateName, ForeignState, ProcessIdOrUnknown,
    SimpleStateMapper, StateCode,
};
use crate::storage::{SshStorageAccessor, StorageAccessor, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// How long to wait for the remote wrapper to write its pid file
const PID_FILE_TIMEOUT: Duration = Duration::from_secs(30);
const PID_FILE_POLL: Duration = Duration::from_millis(500);

/// Polling interval for `wait`; remote polls are expensive
const EXIT_POLL: Duration = Duration::from_secs(2);

/// Executor submitting to a remote host over SSH
pub struct SshExecutor {
    runner: Arc<SshRunner>,
    storage: Arc<dyn StorageAccessor>,
    mapper: SimpleStateMapper<UnixProcState>,
}

impl SshExecutor {
    /// Create an executor for `target` with the given connection-retry
    /// policy
    pub fn new(target: SshTarget, retry: RetryPolicy) -> Self {
        let runner = Arc::new(SshRunner::new(target, retry));
        let storage = Arc::new(SshStorageAccessor::new(runner.clone()));
        Self {
            runner,
            storage,
            mapper: unix_state_mapper(),
        }
    }

    /// Shell line testing whether the remote process carries this
    /// execution's id marker in its environment
    fn marker_check_command(pid: &ProcessId, execution_id: &ExecutionId) -> ShellCommand {
        let marker = format!("{}={}", ExecutionId::ENV_VAR, execution_id);
        ShellCommand::new("sh").arg("-c").arg(format!(
            "grep -F -z -q {} /proc/{}/environ",
            quote(&marker),
            pid.value
        ))
    }

    async fn marker_matches(&self, pid: &ProcessId, execution_id: &ExecutionId) -> bool {
        let command = Self::marker_check_command(pid, execution_id);
        match self.runner.run(&command).await {
            Ok(output) => output.succeeded(),
            Err(_) => false,
        }
    }

    async fn read_pid_file(&self, paths: &ExecutionPaths) -> ExecutorResult<Option<ProcessId>> {
        match self.storage.read_to_string(&paths.pid_file()).await {
            Ok(content) => Ok(Some(ProcessId::new(
                content.trim().to_string(),
                self.hostname(),
            ))),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn observe(
        &self,
        execution_id: &ExecutionId,
        paths: &ExecutionPaths,
        pid: ProcessId,
    ) -> ExecutorResult<ForeignState<UnixProcState>> {
        if let Some(exit_code) = read_exit_code(self.storage.as_ref(), paths).await? {
            let code = UnixProcState::from_exit_code(Some(exit_code));
            return Ok(code.into_foreign_state(pid, Some(exit_code), Utc::now(), vec![]));
        }

        let stat_command = ShellCommand::new("cat").arg(format!("/proc/{}/stat", pid.value));
        match self.runner.run(&stat_command).await {
            Ok(output) if output.succeeded() => {
                if !self.marker_matches(&pid, execution_id).await {
                    let code = UnixProcState::from_exit_code(None);
                    return Ok(code.into_foreign_state(pid, None, Utc::now(), vec![]));
                }
                let code = UnixProcState::from_stat_line(&output.stdout);
                Ok(code.into_foreign_state(pid, None, Utc::now(), vec![]))
            }
            Ok(_) => {
                // Process gone; the exit file may have appeared meanwhile.
                match read_exit_code(self.storage.as_ref(), paths).await? {
                    Some(exit_code) => {
                        let code = UnixProcState::from_exit_code(Some(exit_code));
                        Ok(code.into_foreign_state(pid, Some(exit_code), Utc::now(), vec![]))
                    }
                    None => {
                        let code = UnixProcState::from_exit_code(None);
                        Ok(code.into_foreign_state(
                            pid,
                            None,
                            Utc::now(),
                            vec!["remote process gone without exit code".to_string()],
                        ))
                    }
                }
            }
            Err(e) if e.is_transient() => {
                // Connection trouble survived all retries: nothing can be
                // said about the process right now.
                Ok(ForeignState::unknown(
                    UnixProcState::not_available(),
                    pid,
                    Utc::now(),
                    vec![e.to_string()],
                ))
            }
            Err(e) => Err(e),
        }
    }

    async fn launch_wrapper(&self, paths: &ExecutionPaths) -> ExecutorResult<()> {
        // setsid detaches the wrapper from the ssh session so it survives
        // the channel closing.
        let wrapper = quote(&paths.wrapper_file().to_string_lossy());
        let command = ShellCommand::new("sh").arg("-c").arg(format!(
            "setsid /bin/sh {} < /dev/null > /dev/null 2>&1 &",
            wrapper
        ));
        let output = self.runner.run(&command).await?;
        if !output.succeeded() {
            return Err(ExecutorError::Submission {
                reason: format!("failed to launch remote wrapper: {}", output.stderr.trim()),
            });
        }
        Ok(())
    }

    async fn wait_for_pid_file(&self, paths: &ExecutionPaths) -> ExecutorResult<Option<ProcessId>> {
        let deadline = tokio::time::Instant::now() + PID_FILE_TIMEOUT;
        loop {
            if let Some(pid) = self.read_pid_file(paths).await? {
                return Ok(Some(pid));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(PID_FILE_POLL).await;
        }
    }
}

#[async_trait]
impl Executor for SshExecutor {
    type Code = UnixProcState;

    fn hostname(&self) -> String {
        self.runner.target().host.clone()
    }

    fn storage(&self) -> Arc<dyn StorageAccessor> {
        self.storage.clone()
    }

    fn mapper(&self) -> &SimpleStateMapper<UnixProcState> {
        &self.mapper
    }

    async fn execute(
        &self,
        execution_id: &ExecutionId,
        command: &ShellCommand,
        paths: &ExecutionPaths,
        _settings: &ExecutionSettings,
    ) -> ExecutorResult<ExecutionState<UnixProcState>> {
        if !self.storage.exists(&paths.workdir).await? {
            return Ok(ExecutionState::synthetic_failure(
                *execution_id,
                ExecutionStateName::Failed,
                ProcessIdOrUnknown::Unknown,
                Some(1),
                format!(
                    "remote working directory {} does not exist",
                    paths.workdir.display()
                ),
            ));
        }
        self.storage.create_dir(&paths.log_dir).await?;

        if let Some(pid) = self.read_pid_file(paths).await? {
            tracing::info!(
                execution_id = %execution_id,
                pid = %pid,
                host = %self.hostname(),
                "recovering previously submitted remote execution"
            );
            let observed = self.observe(execution_id, paths, pid).await?;
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

        self.launch_wrapper(paths).await?;
        tracing::info!(
            execution_id = %execution_id,
            command = %command,
            host = %self.hostname(),
            "submitted remote execution"
        );

        match self.wait_for_pid_file(paths).await? {
            Some(pid) => {
                let observed = self.observe(execution_id, paths, pid).await?;
                let state = ExecutionState::start(*execution_id);
                Ok(self.mapper.transition(state, observed)?)
            }
            None => Ok(ExecutionState::synthetic_failure(
                *execution_id,
                ExecutionStateName::SystemError,
                ProcessIdOrUnknown::Unknown,
                None,
                "remote wrapper did not report a process id in time",
            )),
        }
    }

    async fn get_status(
        &self,
        execution_id: &ExecutionId,
        paths: &ExecutionPaths,
        pid: Option<&ProcessId>,
    ) -> ExecutorResult<Option<ForeignState<UnixProcState>>> {
        let pid = match pid {
            Some(pid) => Some(pid.clone()),
            None => self.read_pid_file(paths).await?,
        };
        let Some(pid) = pid else {
            return Ok(None);
        };
        Ok(Some(self.observe(execution_id, paths, pid).await?))
    }

    async fn get_result(
        &self,
        state: &ExecutionState<UnixProcState>,
        command: &ShellCommand,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<ExecutionResult> {
        collect_result(self.storage.as_ref(), state, command, paths).await
    }

    async fn kill(
        &self,
        state: &ExecutionState<UnixProcState>,
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
        let command = ShellCommand::new("kill")
            .arg("-s")
            .arg(signal.name())
            .arg(format!("-{}", pid.value));
        let output = self.runner.run(&command).await?;
        if output.succeeded() {
            return Ok(true);
        }
        Ok(output.stderr.to_lowercase().contains("no such process"))
    }

    async fn wait(
        &self,
        state: &ExecutionState<UnixProcState>,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<()> {
        if state.is_terminal() {
            return Ok(());
        }
        loop {
            if read_exit_code(self.storage.as_ref(), paths).await?.is_some() {
                return Ok(());
            }
            if let Some(pid) = state.pid() {
                let stat = format!("/proc/{}/stat", pid.value);
                if !self.storage.exists(std::path::Path::new(&stat)).await? {
                    return Ok(());
                }
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_check_command_shape() {
        let id = ExecutionId::new();
        let pid = ProcessId::new("4711", "remote");
        let command = SshExecutor::marker_check_command(&pid, &id);
        let line = command.to_command_line();
        assert!(line.contains("grep -F -z -q"));
        assert!(line.contains(&format!("RUNBRIDGE_EXECUTION_ID={}", id)));
        assert!(line.contains("/proc/4711/environ"));
    }

    #[test]
    fn test_hostname_reflects_target() {
        let executor = SshExecutor::new(
            SshTarget::new("worker", "compute.example.org"),
            RetryPolicy::none(),
        );
        assert_eq!(executor.hostname(), "compute.example.org");
        assert_eq!(executor.storage().location(), "compute.example.org");
    }
}

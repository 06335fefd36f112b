//! Executor running commands as local Unix processes
//!
//! Submission stages an environment file and a wrapper script into the
//! execution's log directory and starts the wrapper detached from this
//! process's fate. The wrapper's bookkeeping files (`pid`, `start_time`,
//! `exit_code`, `end_time`) make status and results recoverable by a
//! process that never submitted anything, which is what makes submission
//! idempotent.

use super::unix::{unix_state_mapper, UnixProcState};
use super::wrapper::{env_file_content, wrapper_script};
use super::{
    collect_result, read_exit_code, ExecutionPaths, ExecutionSettings, Executor, ExecutorError,
    ExecutorResult, KillSignal, LocalRunner, ShellCommand, ShellRunner,
};
use crate::common::ids::{ExecutionId, ProcessId};
use crate::execution::{
    ExecutionResult, ExecutionState, ExecutionStateName, ForeignState, ProcessIdOrUnknown,
    SimpleStateMapper, StateCode,
};
use crate::storage::{LocalStorageAccessor, StorageAccessor, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How long to wait for the wrapper to write its pid file after spawning
const PID_FILE_TIMEOUT: Duration = Duration::from_secs(10);
const PID_FILE_POLL: Duration = Duration::from_millis(50);

/// Polling interval for `wait` when no child handle is held
const EXIT_POLL: Duration = Duration::from_millis(500);

/// Executor submitting to the local host
pub struct LocalExecutor {
    storage: Arc<dyn StorageAccessor>,
    mapper: SimpleStateMapper<UnixProcState>,
    runner: LocalRunner,
    hostname: String,
    // Child handles for executions submitted by this process. Executions
    // recovered after a restart have no handle and are waited on via the
    // exit-code file instead.
    children: DashMap<ExecutionId, Arc<Mutex<tokio::process::Child>>>,
}

impl LocalExecutor {
    /// Create a local executor
    pub fn new() -> Self {
        Self {
            storage: Arc::new(LocalStorageAccessor::new()),
            mapper: unix_state_mapper(),
            runner: LocalRunner::new(),
            hostname: local_hostname(),
            children: DashMap::new(),
        }
    }

    async fn read_pid_file(&self, paths: &ExecutionPaths) -> ExecutorResult<Option<ProcessId>> {
        match self.storage.read_to_string(&paths.pid_file()).await {
            Ok(content) => Ok(Some(ProcessId::new(
                content.trim().to_string(),
                self.hostname.clone(),
            ))),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `/proc/<pid>/environ` carries this execution's id marker.
    /// Guards against pid reuse between observations.
    async fn marker_matches(&self, pid: &ProcessId, execution_id: &ExecutionId) -> bool {
        let environ_path = format!("/proc/{}/environ", pid.value);
        let marker = format!("{}={}", ExecutionId::ENV_VAR, execution_id);
        match tokio::fs::read(&environ_path).await {
            Ok(bytes) => bytes
                .split(|b| *b == 0)
                .any(|entry| entry == marker.as_bytes()),
            Err(_) => false,
        }
    }

    /// Observe a live process through `/proc/<pid>/stat`, falling back to
    /// the exit-code file when the process is gone.
    async fn observe(
        &self,
        execution_id: &ExecutionId,
        paths: &ExecutionPaths,
        pid: ProcessId,
    ) -> ExecutorResult<ForeignState<UnixProcState>> {
        // Terminal files first: once exit_code exists the letter in /proc
        // (if any) refers to an unrelated or zombie process.
        if let Some(exit_code) = read_exit_code(self.storage.as_ref(), paths).await? {
            let code = UnixProcState::from_exit_code(Some(exit_code));
            return Ok(code.into_foreign_state(pid, Some(exit_code), Utc::now(), vec![]));
        }

        let stat_path = format!("/proc/{}/stat", pid.value);
        match tokio::fs::read_to_string(&stat_path).await {
            Ok(line) => {
                if !self.marker_matches(&pid, execution_id).await {
                    // Pid was reused by an unrelated process. The wrapper
                    // is gone and never wrote an exit code.
                    let code = UnixProcState::from_exit_code(None);
                    return Ok(code.into_foreign_state(pid, None, Utc::now(), vec![]));
                }
                let code = UnixProcState::from_stat_line(&line);
                Ok(code.into_foreign_state(pid, None, Utc::now(), vec![]))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Re-check the exit file: the process may have finished
                // between the two reads.
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
                            vec!["process gone without exit code".to_string()],
                        ))
                    }
                }
            }
            Err(e) => {
                let code = UnixProcState::not_available();
                Ok(ForeignState::unknown(
                    code,
                    pid,
                    Utc::now(),
                    vec![format!("cannot read {}: {}", stat_path, e)],
                ))
            }
        }
    }

    async fn spawn_wrapper(
        &self,
        execution_id: &ExecutionId,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<()> {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg(paths.wrapper_file())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .process_group(0);
        let child = cmd.spawn()?;
        self.children
            .insert(*execution_id, Arc::new(Mutex::new(child)));
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

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Hostname of the local machine, best effort
pub(crate) fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[async_trait]
impl Executor for LocalExecutor {
    type Code = UnixProcState;

    fn hostname(&self) -> String {
        self.hostname.clone()
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
                format!("working directory {} does not exist", paths.workdir.display()),
            ));
        }
        self.storage.create_dir(&paths.log_dir).await?;

        // Idempotent resubmission: a pid file means an earlier submission
        // of this execution already started the wrapper. Re-observe instead
        // of starting a second process.
        if let Some(pid) = self.read_pid_file(paths).await? {
            tracing::info!(
                execution_id = %execution_id,
                pid = %pid,
                "recovering previously submitted execution"
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

        self.spawn_wrapper(execution_id, paths).await?;
        tracing::info!(
            execution_id = %execution_id,
            command = %command,
            workdir = %paths.workdir.display(),
            "submitted local execution"
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
                "wrapper did not report a process id in time",
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
        // Signal the whole process group started by the wrapper.
        let command = ShellCommand::new("kill")
            .arg("-s")
            .arg(signal.name())
            .arg(format!("-{}", pid.value));
        let output = self.runner.run(&command).await?;
        if output.succeeded() {
            return Ok(true);
        }
        // "No such process" means it already ended, which is fine.
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
        if let Some(entry) = self
            .children
            .get(&state.execution_id())
            .map(|e| e.value().clone())
        {
            let mut child = entry.lock().await;
            child.wait().await?;
            return Ok(());
        }
        // Recovered execution without a child handle: poll the exit file.
        loop {
            if read_exit_code(self.storage.as_ref(), paths).await?.is_some() {
                return Ok(());
            }
            if let Some(pid) = state.pid() {
                let stat = format!("/proc/{}/stat", pid.value);
                if !tokio::fs::try_exists(&stat).await.unwrap_or(false) {
                    return Ok(());
                }
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }
}

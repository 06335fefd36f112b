//! End-to-end lifecycle tests against a scripted fake backend: submit,
//! reconcile over several sweeps, finalize, cancel, and unknown-timeout
//! handling.

use async_trait::async_trait;
use chrono::Utc;
use runbridge::db::{MemoryRunDatabase, RunDatabase};
use runbridge::execution::{
    ExecutionResult, ExecutionState, ExecutionStateName, ForeignState, ProcessIdOrUnknown,
    SimpleStateMapper, StateCode,
};
use runbridge::executor::{
    ExecutionPaths, ExecutionSettings, Executor, ExecutorResult, KillSignal, ShellCommand,
};
use runbridge::manager::{Manager, TaskQueue, TaskState};
use runbridge::run::{ProcessingStage, RunRequest, RunStatus};
use runbridge::storage::{LocalStorageAccessor, StorageAccessor};
use runbridge::{Config, ExecutionId, ProcessId};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FakeCode {
    Queued,
    Active,
    Done,
    Crashed,
    Gone,
    NotAvailable,
}

impl fmt::Display for FakeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl StateCode for FakeCode {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("QUEUED") => FakeCode::Queued,
            Some("ACTIVE") => FakeCode::Active,
            Some("DONE") => FakeCode::Done,
            Some("CRASHED") => FakeCode::Crashed,
            Some("GONE") => FakeCode::Gone,
            _ => FakeCode::NotAvailable,
        }
    }

    fn not_available() -> Self {
        FakeCode::NotAvailable
    }

    fn is_terminal_code(&self) -> bool {
        matches!(self, FakeCode::Done | FakeCode::Crashed | FakeCode::Gone)
    }

    fn is_unknown_code(&self) -> bool {
        matches!(self, FakeCode::NotAvailable)
    }

    fn is_success_code(&self) -> bool {
        matches!(self, FakeCode::Done)
    }
}

fn fake_pid() -> ProcessId {
    ProcessId::new("2222", "fakehost")
}

/// Executor returning a pre-scripted sequence of observations, one per
/// status query.
struct ScriptedExecutor {
    storage: Arc<dyn StorageAccessor>,
    mapper: SimpleStateMapper<FakeCode>,
    script: Mutex<VecDeque<ForeignState<FakeCode>>>,
    fail_submission: bool,
    killed: AtomicBool,
}

impl ScriptedExecutor {
    fn new(script: Vec<ForeignState<FakeCode>>) -> Self {
        Self {
            storage: Arc::new(LocalStorageAccessor::new()),
            mapper: SimpleStateMapper::new(
                [
                    (FakeCode::Queued, ExecutionStateName::Pending),
                    (FakeCode::Active, ExecutionStateName::Running),
                    (FakeCode::Done, ExecutionStateName::Succeeded),
                    (FakeCode::Crashed, ExecutionStateName::Failed),
                    (FakeCode::Gone, ExecutionStateName::Canceled),
                ]
                .into_iter()
                .collect(),
            ),
            script: Mutex::new(script.into()),
            fail_submission: false,
            killed: AtomicBool::new(false),
        }
    }

    fn refusing_submission() -> Self {
        let mut executor = Self::new(vec![]);
        executor.fail_submission = true;
        executor
    }

    fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    type Code = FakeCode;

    fn hostname(&self) -> String {
        "fakehost".to_string()
    }

    fn storage(&self) -> Arc<dyn StorageAccessor> {
        Arc::clone(&self.storage)
    }

    fn mapper(&self) -> &SimpleStateMapper<FakeCode> {
        &self.mapper
    }

    async fn execute(
        &self,
        execution_id: &ExecutionId,
        _command: &ShellCommand,
        _paths: &ExecutionPaths,
        _settings: &ExecutionSettings,
    ) -> ExecutorResult<ExecutionState<FakeCode>> {
        if self.fail_submission {
            return Ok(ExecutionState::synthetic_failure(
                *execution_id,
                ExecutionStateName::SystemError,
                ProcessIdOrUnknown::Unknown,
                None,
                "backend refused the job",
            ));
        }
        let start = ExecutionState::start(*execution_id);
        let accepted = ForeignState::known(FakeCode::Queued, fake_pid(), Utc::now(), vec![]);
        Ok(self.mapper.transition(start, accepted)?)
    }

    async fn get_status(
        &self,
        _execution_id: &ExecutionId,
        _paths: &ExecutionPaths,
        _pid: Option<&ProcessId>,
    ) -> ExecutorResult<Option<ForeignState<FakeCode>>> {
        Ok(self
            .script
            .lock()
            .expect("script lock poisoned")
            .pop_front())
    }

    async fn get_result(
        &self,
        state: &ExecutionState<FakeCode>,
        command: &ShellCommand,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<ExecutionResult> {
        Ok(ExecutionResult {
            command: command.clone(),
            state_name: state.name(),
            process_id: state.pid().cloned(),
            exit_code: state.exit_code(),
            stdout_file: Some(paths.stdout_file()),
            stderr_file: Some(paths.stderr_file()),
            stdin_file: None,
            start_time: None,
            end_time: None,
        })
    }

    async fn kill(
        &self,
        _state: &ExecutionState<FakeCode>,
        _signal: KillSignal,
    ) -> ExecutorResult<bool> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn wait(
        &self,
        _state: &ExecutionState<FakeCode>,
        _paths: &ExecutionPaths,
    ) -> ExecutorResult<()> {
        Ok(())
    }
}

fn request() -> RunRequest {
    RunRequest {
        workflow_url: "workflows/Snakefile".to_string(),
        workflow_type: "SMK".to_string(),
        workflow_type_version: "7.30.2".to_string(),
        workflow_params: json!({"sample": "A"}),
        tags: HashMap::new(),
    }
}

struct Harness {
    manager: Manager<ScriptedExecutor>,
    executor: Arc<ScriptedExecutor>,
    database: Arc<MemoryRunDatabase>,
    queue: TaskQueue,
    _data_dir: tempfile::TempDir,
}

fn harness(executor: ScriptedExecutor) -> Harness {
    harness_with(executor, Config::default())
}

fn harness_with(executor: ScriptedExecutor, mut config: Config) -> Harness {
    let data_dir = tempfile::tempdir().expect("tempdir");
    config.data_dir = data_dir.path().to_path_buf();
    let database = Arc::new(MemoryRunDatabase::new());
    let executor = Arc::new(executor);
    let queue = TaskQueue::new();
    let manager = Manager::new(
        config,
        database.clone(),
        executor.clone(),
        queue.clone(),
    );
    Harness {
        manager,
        executor,
        database,
        queue,
        _data_dir: data_dir,
    }
}

fn known(code: FakeCode) -> ForeignState<FakeCode> {
    ForeignState::known(code, fake_pid(), Utc::now(), vec![])
}

fn terminal(code: FakeCode, exit_code: Option<i32>) -> ForeignState<FakeCode> {
    ForeignState::terminal(code, fake_pid(), Utc::now(), vec![], exit_code)
}

fn unknown() -> ForeignState<FakeCode> {
    ForeignState::unknown(FakeCode::NotAvailable, fake_pid(), Utc::now(), vec![])
}

#[tokio::test]
async fn test_full_lifecycle_to_completion() {
    let h = harness(ScriptedExecutor::new(vec![
        known(FakeCode::Active),
        terminal(FakeCode::Done, Some(0)),
    ]));

    let run = h.manager.create_run("alice", request()).await.unwrap();
    let run = h.manager.prepare(run).await.unwrap();
    assert_eq!(run.processing_stage(), ProcessingStage::PreparedExecution);
    assert!(run.execution_id.is_some());
    let paths = h.manager.paths_for(&run);
    assert!(paths.workdir.is_dir());
    assert!(paths.log_dir.is_dir());

    let command = ShellCommand::new("snakemake").arg("--cores=1");
    let run = h
        .manager
        .submit(run, &command, &ExecutionSettings::default())
        .await
        .unwrap();
    assert_eq!(run.processing_stage(), ProcessingStage::AwaitingStart);
    let log = run.state_log.as_ref().expect("state log after submit");
    assert_eq!(log.name, ExecutionStateName::Pending);
    assert_eq!(log.executor_hostname, "fakehost");

    // First sweep observes the running process.
    h.manager.sweep().await;
    let run = h.database.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.processing_stage(), ProcessingStage::StartedExecution);
    assert_eq!(run.status(), RunStatus::Running);

    // Second sweep observes completion and finalizes.
    h.manager.sweep().await;
    let run = h.database.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.processing_stage(), ProcessingStage::FinishedExecution);
    assert_eq!(run.status(), RunStatus::Complete);
    assert_eq!(run.execution_log.exit_code, Some(0));
    assert_eq!(run.execution_log.command.as_ref(), Some(&command));
    assert!(run.execution_log.stdout_file.is_some());
    assert!(run.is_finished());

    // Further sweeps leave the finished run alone.
    let version = run.db_version;
    h.manager.sweep().await;
    let run = h.database.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.db_version, version);
}

#[tokio::test]
async fn test_command_failure_classifies_as_executor_error() {
    let h = harness(ScriptedExecutor::new(vec![
        known(FakeCode::Active),
        terminal(FakeCode::Crashed, Some(7)),
    ]));

    let run = h.manager.create_run("alice", request()).await.unwrap();
    let run = h.manager.prepare(run).await.unwrap();
    let run = h
        .manager
        .submit(
            run,
            &ShellCommand::new("false"),
            &ExecutionSettings::default(),
        )
        .await
        .unwrap();

    h.manager.sweep().await;
    h.manager.sweep().await;
    let run = h.database.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.processing_stage(), ProcessingStage::FinishedExecution);
    assert_eq!(run.status(), RunStatus::ExecutorError);
    assert_eq!(run.execution_log.exit_code, Some(7));
}

#[tokio::test]
async fn test_refused_submission_finalizes_as_system_error() {
    let h = harness(ScriptedExecutor::refusing_submission());

    let run = h.manager.create_run("alice", request()).await.unwrap();
    let run = h.manager.prepare(run).await.unwrap();
    let run = h
        .manager
        .submit(
            run,
            &ShellCommand::new("snakemake"),
            &ExecutionSettings::default(),
        )
        .await
        .unwrap();

    // The refusal is a synthetic terminal state, not a lost run.
    assert_eq!(run.processing_stage(), ProcessingStage::SystemError);
    assert_eq!(run.status(), RunStatus::SystemError);
    let stored = h.database.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.processing_stage(), ProcessingStage::SystemError);
}

#[tokio::test]
async fn test_cancellation_flow() {
    let h = harness(ScriptedExecutor::new(vec![
        known(FakeCode::Active),
        // Observed by the cancel request before the kill is delivered.
        known(FakeCode::Active),
        terminal(FakeCode::Gone, None),
    ]));

    let run = h.manager.create_run("alice", request()).await.unwrap();
    let run = h.manager.prepare(run).await.unwrap();
    let run = h
        .manager
        .submit(
            run,
            &ShellCommand::new("snakemake"),
            &ExecutionSettings::default(),
        )
        .await
        .unwrap();

    h.manager.sweep().await;
    let run = h
        .manager
        .request_cancel(&run.id, KillSignal::Term)
        .await
        .unwrap();
    assert_eq!(run.processing_stage(), ProcessingStage::RequestedCancel);
    assert_eq!(run.status(), RunStatus::Canceling);
    assert!(h.executor.was_killed());

    // Cancellation is confirmed only by an observed terminal state.
    h.manager.sweep().await;
    let run = h.database.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.processing_stage(), ProcessingStage::Canceled);
    assert_eq!(run.status(), RunStatus::Canceled);
}

#[tokio::test]
async fn test_unknown_observations_wait_by_default() {
    let h = harness(ScriptedExecutor::new(vec![unknown(), unknown()]));

    let run = h.manager.create_run("alice", request()).await.unwrap();
    let run = h.manager.prepare(run).await.unwrap();
    let run = h
        .manager
        .submit(
            run,
            &ShellCommand::new("snakemake"),
            &ExecutionSettings::default(),
        )
        .await
        .unwrap();

    h.manager.sweep().await;
    let first = h.database.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(first.processing_stage(), ProcessingStage::AwaitingStart);
    let first_since = first.state_log.as_ref().unwrap().unknown_since;
    assert!(first_since.is_some());

    // The streak start is carried across sweeps, not restarted.
    h.manager.sweep().await;
    let second = h.database.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(second.processing_stage(), ProcessingStage::AwaitingStart);
    assert_eq!(second.state_log.as_ref().unwrap().unknown_since, first_since);
}

#[tokio::test]
async fn test_unknown_timeout_closes_run_as_system_error() {
    let mut config = Config::default();
    config.unknown_state_timeout = Some(Duration::ZERO);
    let h = harness_with(ScriptedExecutor::new(vec![unknown()]), config);

    let run = h.manager.create_run("alice", request()).await.unwrap();
    let run = h.manager.prepare(run).await.unwrap();
    let run = h
        .manager
        .submit(
            run,
            &ShellCommand::new("snakemake"),
            &ExecutionSettings::default(),
        )
        .await
        .unwrap();

    h.manager.sweep().await;
    let run = h.database.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.processing_stage(), ProcessingStage::SystemError);
    assert_eq!(run.status(), RunStatus::SystemError);
}

#[tokio::test]
async fn test_dispatched_reconciliation_reports_task_state() {
    let h = harness(ScriptedExecutor::new(vec![terminal(
        FakeCode::Done,
        Some(0),
    )]));

    let run = h.manager.create_run("alice", request()).await.unwrap();
    let run = h.manager.prepare(run).await.unwrap();
    let run = h
        .manager
        .submit(
            run,
            &ShellCommand::new("snakemake"),
            &ExecutionSettings::default(),
        )
        .await
        .unwrap();

    let run = h.manager.dispatch_reconciliation(run).await.unwrap();
    let task_id = run.task_id.clone().expect("task id recorded");
    h.queue.join(&task_id).await;
    assert_eq!(h.queue.state(&task_id), Some(TaskState::Success));
    assert_eq!(
        h.manager.task_stage(&run),
        Some(ProcessingStage::FinishedExecution)
    );

    let stored = h.database.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.processing_stage(), ProcessingStage::FinishedExecution);
    assert_eq!(stored.status(), RunStatus::Complete);
}

//! Run orchestration and the periodic reconciliation loop
//!
//! The [`Manager`] drives each run through its lifecycle: accept and
//! validate the request, stage the execution directory, submit through an
//! [`Executor`], then reconcile periodically by folding fresh backend
//! observations into the persisted run under compare-and-swap. No `Run`
//! value is ever shared mutably between actors; every pass reconstructs
//! state from the last persisted snapshot and re-persists through the
//! database's optimistic-concurrency contract.

mod task_queue;

pub use task_queue::{TaskQueue, TaskState};

use crate::config::Config;
use crate::db::{DatabaseError, RunDatabase, RunQuery};
use crate::error::{Result, RunbridgeError};
use crate::execution::{ExecutionState, ExecutionStateName};
use crate::executor::{ExecutionPaths, ExecutionSettings, Executor, KillSignal, ShellCommand};
use crate::run::{ProcessingStage, Run, RunRequest};
use crate::ExecutionId;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The processing stage implied by a generalized execution state, or `None`
/// for the pre-observation placeholder.
fn stage_for_state(name: ExecutionStateName) -> Option<ProcessingStage> {
    match name {
        ExecutionStateName::Start => None,
        ExecutionStateName::Pending | ExecutionStateName::Held => {
            Some(ProcessingStage::AwaitingStart)
        }
        ExecutionStateName::Running => Some(ProcessingStage::StartedExecution),
        ExecutionStateName::Paused => Some(ProcessingStage::Paused),
        ExecutionStateName::Succeeded | ExecutionStateName::Failed => {
            Some(ProcessingStage::FinishedExecution)
        }
        ExecutionStateName::Canceled => Some(ProcessingStage::Canceled),
        ExecutionStateName::SystemError => Some(ProcessingStage::SystemError),
    }
}

/// Conflict resolution for reconciliation writes.
///
/// The stored run wins on anything another actor may have changed; our
/// freshly observed execution bookkeeping is reapplied on top. A stage that
/// can no longer be reached (for example a cancel arrived concurrently)
/// keeps the stored stage.
fn merge_reconciliation(attempted: Run, current: &Run) -> Run {
    let attempted_stage = attempted.processing_stage();
    let mut merged = current.clone();
    merged.execution_id = merged.execution_id.or(attempted.execution_id);
    merged.execution_log = attempted.execution_log;
    if attempted.state_log.is_some() {
        merged.state_log = attempted.state_log;
    }
    if attempted.task_id.is_some() {
        merged.task_id = attempted.task_id;
    }
    if !attempted.outputs.is_empty() {
        merged.outputs = attempted.outputs;
    }
    if merged.progress_to(attempted_stage).is_err() {
        tracing::debug!(
            run_id = %merged.id,
            stored = %merged.processing_stage(),
            attempted = %attempted_stage,
            "conflict resolution keeps stored stage"
        );
    }
    merged
}

/// Orchestrates runs against one executor backend and one database
pub struct Manager<E: Executor + 'static> {
    config: Config,
    database: Arc<dyn RunDatabase>,
    executor: Arc<E>,
    task_queue: TaskQueue,
}

impl<E: Executor + 'static> Clone for Manager<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            database: Arc::clone(&self.database),
            executor: Arc::clone(&self.executor),
            task_queue: self.task_queue.clone(),
        }
    }
}

impl<E: Executor + 'static> Manager<E> {
    /// Create a manager
    pub fn new(
        config: Config,
        database: Arc<dyn RunDatabase>,
        executor: Arc<E>,
        task_queue: TaskQueue,
    ) -> Self {
        Self {
            config,
            database,
            executor,
            task_queue,
        }
    }

    /// The per-run directory layout under the configured data directory
    pub fn paths_for(&self, run: &Run) -> ExecutionPaths {
        let base = self.config.data_dir.join(run.id.to_string());
        ExecutionPaths::new(base.join("work"), base.join("log"))
    }

    /// Validate and persist a fresh run request.
    ///
    /// Rejections happen here, before any executor or database interaction,
    /// with a field-level reason.
    pub async fn create_run(&self, user_id: &str, request: RunRequest) -> Result<Run> {
        request.validate(&self.config.supported_workflow_types)?;
        let run = Run::new(user_id, request);
        tracing::info!(run_id = %run.id, user_id, "run created");
        Ok(self.database.insert_run(run).await?)
    }

    /// Stage the run's execution directories and assign its execution id
    pub async fn prepare(&self, mut run: Run) -> Result<Run> {
        let paths = self.paths_for(&run);
        let storage = self.executor.storage();
        storage.create_dir(&paths.workdir).await?;
        storage.create_dir(&paths.log_dir).await?;

        run.execution_id = run.execution_id.or_else(|| Some(ExecutionId::new()));
        run.execution_log.workdir = Some(paths.workdir);
        run.progress_to(ProcessingStage::PreparedExecution)?;
        self.persist(run).await
    }

    /// Submit the run's command to the backend.
    ///
    /// Submission failures surface as synthetic terminal states from the
    /// executor and finalize the run here, never as a lost run record.
    pub async fn submit(
        &self,
        mut run: Run,
        command: &ShellCommand,
        settings: &ExecutionSettings,
    ) -> Result<Run> {
        let Some(execution_id) = run.execution_id else {
            return Err(RunbridgeError::Other(format!(
                "Run {} has no execution id; prepare it before submitting",
                run.id
            )));
        };
        let paths = self.paths_for(&run);
        run.execution_log.command = Some(command.clone());

        let state = self
            .executor
            .execute(&execution_id, command, &paths, settings)
            .await?;
        run.record_state(&state, &self.executor.hostname());

        if state.is_terminal() {
            self.finalize(&mut run, &state, &paths).await?;
        } else {
            run.progress_to(ProcessingStage::SubmittedExecution)?;
            if let Some(stage) = stage_for_state(state.name()) {
                run.progress_to(stage)?;
            }
        }
        self.persist(run).await
    }

    /// Observe the backend once and fold the observation into the run.
    ///
    /// One unit of reconciliation work: reconstructs the execution state
    /// from the persisted snapshot, asks the executor for an update, and
    /// re-persists under compare-and-swap. Terminal observations pull the
    /// execution result and finalize the stage.
    pub async fn reconcile_run(&self, mut run: Run) -> Result<Run> {
        if run.is_finished() {
            return Ok(run);
        }
        if matches!(
            run.processing_stage(),
            ProcessingStage::RunCreated | ProcessingStage::PreparedExecution
        ) {
            return Ok(run);
        }
        let Some(execution_id) = run.execution_id else {
            // A cancel can arrive before anything was submitted.
            if run.processing_stage() == ProcessingStage::RequestedCancel {
                run.progress_to(ProcessingStage::Canceled)?;
                return self.persist(run).await;
            }
            return Err(RunbridgeError::Other(format!(
                "Run {} is in stage {} without an execution id",
                run.id,
                run.processing_stage()
            )));
        };

        let paths = self.paths_for(&run);
        let previous_unknown_since = run.state_log.as_ref().and_then(|log| log.unknown_since);
        let resumed = match &run.state_log {
            Some(log) => ExecutionState::resume(execution_id, log.name, log.created_at),
            None => ExecutionState::resume(execution_id, ExecutionStateName::Start, run.request_time),
        };

        let state = match self.executor.update_status(resumed, &paths).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "observation failed; closing run");
                run.progress_to(ProcessingStage::SystemError)?;
                return self.persist(run).await;
            }
        };
        run.record_state(&state, &self.executor.hostname());

        // A streak of unknown observations spans sweeps; its start is
        // carried in the persisted snapshot.
        let unknown_since = state
            .unknown_since()
            .map(|current| previous_unknown_since.unwrap_or(current));
        if let Some(log) = &mut run.state_log {
            log.unknown_since = unknown_since;
        }
        if let (Some(timeout), Some(since)) = (self.config.unknown_state_timeout, unknown_since) {
            let age = (Utc::now() - since).to_std().unwrap_or_default();
            if age >= timeout {
                tracing::warn!(
                    run_id = %run.id,
                    unknown_for_secs = age.as_secs(),
                    "backend unknown for longer than the configured timeout"
                );
                run.progress_to(ProcessingStage::SystemError)?;
                return self.persist(run).await;
            }
        }

        if state.is_terminal() {
            self.finalize(&mut run, &state, &paths).await?;
        } else if run.processing_stage() != ProcessingStage::RequestedCancel {
            if let Some(stage) = stage_for_state(state.name()) {
                run.progress_to(stage)?;
            }
        }
        self.persist(run).await
    }

    /// Request cancellation of a run.
    ///
    /// Moves the run to `RequestedCancel`, delivers a best-effort kill to
    /// the backend, and leaves confirmation to later reconciliation sweeps:
    /// only an observed terminal state finalizes the run as `Canceled`.
    pub async fn request_cancel(&self, run_id: &Uuid, signal: KillSignal) -> Result<Run> {
        let mut run = self
            .database
            .get_run(run_id)
            .await?
            .ok_or(DatabaseError::RunNotFound { id: *run_id })?;
        if run.is_finished() {
            return Ok(run);
        }

        run.progress_to(ProcessingStage::RequestedCancel)?;
        if let Some(task_id) = &run.task_id {
            self.task_queue.revoke(task_id);
        }
        if run.execution_id.is_none() {
            run.progress_to(ProcessingStage::Canceled)?;
            return self.persist(run).await;
        }
        let run = self.persist(run).await?;

        self.deliver_kill(&run, signal).await;
        Ok(run)
    }

    /// Observe the backend to recover the process id, then send the signal.
    /// Failures are logged, not raised; the next sweep tries again.
    async fn deliver_kill(&self, run: &Run, signal: KillSignal) {
        let (Some(execution_id), Some(log)) = (run.execution_id, &run.state_log) else {
            return;
        };
        let paths = self.paths_for(run);
        let resumed = ExecutionState::resume(execution_id, log.name, log.created_at);
        match self.executor.update_status(resumed, &paths).await {
            Ok(state) if !state.is_terminal() => {
                match self.executor.kill(&state, signal).await {
                    Ok(delivered) => tracing::info!(
                        run_id = %run.id,
                        signal = signal.name(),
                        delivered,
                        "kill requested"
                    ),
                    Err(e) => {
                        tracing::warn!(run_id = %run.id, error = %e, "kill delivery failed")
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(run_id = %run.id, error = %e, "observation before kill failed"),
        }
    }

    /// Hand one reconciliation pass to the task queue, recording the task
    /// handle on the run.
    pub async fn dispatch_reconciliation(&self, mut run: Run) -> Result<Run> {
        let manager = self.clone();
        let run_id = run.id;
        let task_id = self.task_queue.submit(async move {
            let Some(current) = manager.database.get_run(&run_id).await? else {
                return Err(RunbridgeError::Other(format!(
                    "Run {run_id} disappeared before reconciliation"
                )));
            };
            manager.reconcile_run(current).await?;
            Ok(())
        });
        run.task_id = Some(task_id);
        self.persist(run).await
    }

    /// The processing stage implied by the run's queued task, if it has one
    pub fn task_stage(&self, run: &Run) -> Option<ProcessingStage> {
        run.task_id
            .as_deref()
            .and_then(|task_id| self.task_queue.state(task_id))
            .map(|state| state.processing_stage())
    }

    /// One reconciliation sweep over all unfinished runs. Per-run failures
    /// are logged and do not stop the sweep.
    pub async fn sweep(&self) {
        let runs = match self.database.get_runs(&RunQuery::unfinished()).await {
            Ok(runs) => runs,
            Err(e) => {
                tracing::error!(error = %e, "could not list unfinished runs");
                return;
            }
        };
        tracing::debug!(count = runs.len(), "reconciliation sweep");
        for run in runs {
            let run_id = run.id;
            if let Err(e) = self.reconcile_run(run).await {
                tracing::error!(run_id = %run_id, error = %e, "reconciliation failed");
            }
        }
    }

    /// Run reconciliation sweeps until `shutdown` is cancelled
    pub async fn monitor(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.monitor_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.monitor_interval.as_secs(),
            "reconciliation monitor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("reconciliation monitor stopping");
                    return;
                }
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Pull the terminal result and move the run to its final stage
    async fn finalize(
        &self,
        run: &mut Run,
        state: &ExecutionState<E::Code>,
        paths: &ExecutionPaths,
    ) -> Result<()> {
        if let Some(command) = run.execution_log.command.clone() {
            match self.executor.get_result(state, &command, paths).await {
                Ok(result) => run.record_result(&result),
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %e, "result collection failed")
                }
            }
        }
        match self.executor.storage().find(&paths.workdir).await {
            Ok(outputs) => run.outputs = outputs,
            Err(e) => tracing::warn!(run_id = %run.id, error = %e, "output listing failed"),
        }

        let target = if run.processing_stage() == ProcessingStage::RequestedCancel {
            ProcessingStage::Canceled
        } else {
            stage_for_state(state.name()).unwrap_or(ProcessingStage::SystemError)
        };
        run.progress_to(target)?;
        tracing::info!(
            run_id = %run.id,
            stage = %target,
            exit_code = run.execution_log.exit_code,
            "run finalized"
        );
        Ok(())
    }

    async fn persist(&self, run: Run) -> Result<Run> {
        Ok(self
            .database
            .update_run(run, Some(&merge_reconciliation), self.config.db_max_tries)
            .await?)
    }
}

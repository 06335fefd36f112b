//! Background task-queue collaborator
//!
//! The manager hands reconciliation units of work to an opaque scheduler
//! and observes their coarse task states. [`TaskQueue`] is an in-process
//! tokio implementation of that contract; a distributed queue can replace
//! it behind the same surface.

use crate::run::ProcessingStage;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use ulid::Ulid;

/// Observable state of one queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Accepted, not yet picked up by a worker
    Pending,
    /// A worker is executing the task
    Started,
    /// The task completed without error
    Success,
    /// The task ended with an error
    Failure,
    /// The queue is going to re-execute the task
    Retry,
    /// The task was revoked before completion
    Revoked,
}

impl TaskState {
    /// Whether the queue will report no further state for this task
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Revoked
        )
    }

    /// The processing stage implied by this task state.
    ///
    /// A `Success` maps to `FinishedExecution`; the externally reported
    /// status is further refined by the recorded exit code. A `Retry` is
    /// treated like a failure: the run's own reconciliation decides whether
    /// anything is recoverable, not the queue.
    pub fn processing_stage(&self) -> ProcessingStage {
        match self {
            TaskState::Pending => ProcessingStage::AwaitingStart,
            TaskState::Started => ProcessingStage::StartedExecution,
            TaskState::Success => ProcessingStage::FinishedExecution,
            TaskState::Failure | TaskState::Retry => ProcessingStage::SystemError,
            TaskState::Revoked => ProcessingStage::Canceled,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

struct TaskEntry {
    state: TaskState,
    handle: Option<JoinHandle<()>>,
}

/// In-process task queue backed by tokio tasks.
///
/// Cheap to clone; all clones share the same task table.
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Arc<DashMap<String, TaskEntry>>,
}

impl TaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a unit of work. Returns the task id under which its state can
    /// be observed.
    pub fn submit<F>(&self, work: F) -> String
    where
        F: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let task_id = Ulid::new().to_string();
        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                state: TaskState::Pending,
                handle: None,
            },
        );

        let tasks = Arc::clone(&self.tasks);
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            set_state(&tasks, &id, TaskState::Started);
            let outcome = match work.await {
                Ok(()) => TaskState::Success,
                Err(e) => {
                    tracing::error!(task_id = %id, error = %e, "queued task failed");
                    TaskState::Failure
                }
            };
            set_state(&tasks, &id, outcome);
        });

        if let Some(mut entry) = self.tasks.get_mut(&task_id) {
            entry.handle = Some(handle);
        }
        task_id
    }

    /// Observe the current state of a task
    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.get(task_id).map(|entry| entry.state)
    }

    /// Revoke a task. Running or pending tasks are aborted; tasks already in
    /// a terminal state are left untouched. Returns whether the task was
    /// revoked.
    pub fn revoke(&self, task_id: &str) -> bool {
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if entry.state.is_terminal() {
            return false;
        }
        entry.state = TaskState::Revoked;
        if let Some(handle) = entry.handle.take() {
            handle.abort();
        }
        true
    }

    /// Wait for a task to reach a terminal state
    pub async fn join(&self, task_id: &str) {
        let handle = self
            .tasks
            .get_mut(task_id)
            .and_then(|mut entry| entry.handle.take());
        if let Some(handle) = handle {
            // Abort during revoke surfaces as a JoinError here.
            let _ = handle.await;
        }
    }
}

fn set_state(tasks: &DashMap<String, TaskEntry>, task_id: &str, state: TaskState) {
    if let Some(mut entry) = tasks.get_mut(task_id) {
        if !entry.state.is_terminal() {
            entry.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunbridgeError;
    use std::time::Duration;

    #[test]
    fn test_task_state_stage_mapping() {
        assert_eq!(
            TaskState::Pending.processing_stage(),
            ProcessingStage::AwaitingStart
        );
        assert_eq!(
            TaskState::Started.processing_stage(),
            ProcessingStage::StartedExecution
        );
        assert_eq!(
            TaskState::Success.processing_stage(),
            ProcessingStage::FinishedExecution
        );
        assert_eq!(
            TaskState::Failure.processing_stage(),
            ProcessingStage::SystemError
        );
        assert_eq!(
            TaskState::Retry.processing_stage(),
            ProcessingStage::SystemError
        );
        assert_eq!(
            TaskState::Revoked.processing_stage(),
            ProcessingStage::Canceled
        );
    }

    #[tokio::test]
    async fn test_successful_task_reaches_success() {
        let queue = TaskQueue::new();
        let task_id = queue.submit(async { Ok(()) });
        queue.join(&task_id).await;
        assert_eq!(queue.state(&task_id), Some(TaskState::Success));
    }

    #[tokio::test]
    async fn test_failing_task_reaches_failure() {
        let queue = TaskQueue::new();
        let task_id =
            queue.submit(async { Err(RunbridgeError::Other("backend unreachable".into())) });
        queue.join(&task_id).await;
        assert_eq!(queue.state(&task_id), Some(TaskState::Failure));
    }

    #[tokio::test]
    async fn test_revoke_aborts_running_task() {
        let queue = TaskQueue::new();
        let task_id = queue.submit(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        // Let the task start before revoking it.
        tokio::task::yield_now().await;
        assert!(queue.revoke(&task_id));
        queue.join(&task_id).await;
        assert_eq!(queue.state(&task_id), Some(TaskState::Revoked));
    }

    #[tokio::test]
    async fn test_revoking_finished_task_is_refused() {
        let queue = TaskQueue::new();
        let task_id = queue.submit(async { Ok(()) });
        queue.join(&task_id).await;
        assert!(!queue.revoke(&task_id));
        assert_eq!(queue.state(&task_id), Some(TaskState::Success));
    }

    #[tokio::test]
    async fn test_unknown_task_has_no_state() {
        let queue = TaskQueue::new();
        assert_eq!(queue.state("no-such-task"), None);
        assert!(!queue.revoke("no-such-task"));
    }
}

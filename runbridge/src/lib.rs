//! Runbridge is a workflow-run execution engine.
//!
//! It accepts workflow run requests, dispatches the resulting shell commands
//! to pluggable compute backends (local Unix processes, SSH-remote processes,
//! LSF and Slurm clusters, Kubernetes jobs), and tracks every run through a
//! well-defined lifecycle until completion, failure, or cancellation.
//!
//! Most backends are only periodically observable, so the heart of the crate
//! is the execution-state reconciliation engine: raw backend observations
//! ([`ForeignState`]) are mapped onto a generalized, backend-independent
//! state machine ([`ExecutionState`]) by per-backend [`SimpleStateMapper`]s,
//! and the resulting [`Run`] snapshots are persisted under optimistic
//! concurrency control ([`RunDatabase`]).
//!
//! # Example
//!
//! ```no_run
//! use runbridge::executor::{Executor, ExecutionPaths, ExecutionSettings, ShellCommand};
//! use runbridge::executor::local::LocalExecutor;
//! use runbridge::ExecutionId;
//!
//! # async fn example() -> runbridge::Result<()> {
//! let executor = LocalExecutor::new();
//! let execution_id = ExecutionId::new();
//! let paths = ExecutionPaths::new("/tmp/run-1/work", "/tmp/run-1/log");
//! let command = ShellCommand::new("echo").arg("hello");
//!
//! let state = executor
//!     .execute(&execution_id, &command, &paths, &ExecutionSettings::default())
//!     .await?;
//! executor.wait(&state, &paths).await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod executor;
pub mod logging;
pub mod manager;
pub mod run;
pub mod storage;

pub use common::ids::{ExecutionId, ProcessId};
pub use common::retry::RetryPolicy;
pub use config::Config;
pub use db::{DatabaseError, MemoryRunDatabase, RunDatabase, RunQuery};
pub use error::{ErrorContext, Result, RunbridgeError};
pub use execution::{
    ExecutionResult, ExecutionState, ExecutionStateName, ForeignState, MapperError,
    SimpleStateMapper, StateCode, StateError,
};
pub use executor::{
    ExecutionPaths, ExecutionSettings, Executor, ExecutorError, ExecutorResult, KillSignal,
    ShellCommand,
};
pub use manager::{Manager, TaskQueue, TaskState};
pub use run::{ProcessingStage, Run, RunRequest, RunStatus, ValidationError};
pub use storage::{StorageAccessor, StorageError};

//! Run persistence with optimistic concurrency
//!
//! The persisted `Run` row is the only shared mutable resource in the
//! system. All mutation goes through a compare-and-swap on the row's
//! `db_version` counter; there is no in-place shared-memory mutation.

mod memory;

pub use memory::MemoryRunDatabase;

use crate::run::{ProcessingStage, Run};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the run database
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// `insert_run` with an id that already exists
    #[error("Run {id} already exists")]
    DuplicateRun {
        /// The conflicting run id
        id: Uuid,
    },

    /// The addressed run was never inserted
    #[error("Run {id} does not exist")]
    RunNotFound {
        /// The missing run id
        id: Uuid,
    },

    /// The compare-and-swap lost against a concurrent writer. Carries both
    /// versions so callers can diff them for merge logic or diagnostics.
    #[error(
        "Concurrent modification of run {id}: attempted version {attempted_version}, \
         current version {current_version}"
    )]
    ConcurrentModification {
        /// The run id under contention
        id: Uuid,
        /// Version the writer based its update on
        attempted_version: u64,
        /// Version currently stored
        current_version: u64,
        /// The rejected value
        attempted: Box<Run>,
        /// The currently stored value
        current: Box<Run>,
    },
}

/// Result type for database operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Merge function invoked on version conflicts: given the attempted run
/// and the currently stored run, produce the value to retry with.
pub type ResolutionFn<'a> = &'a (dyn Fn(Run, &Run) -> Run + Send + Sync);

/// Filters for bulk run queries
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    /// Restrict to one owner
    pub user_id: Option<String>,
    /// Restrict to these stages
    pub stages: Option<Vec<ProcessingStage>>,
    /// Restrict to runs whose lifecycle has not ended
    pub unfinished_only: bool,
}

impl RunQuery {
    /// Query matching every run
    pub fn all() -> Self {
        Self::default()
    }

    /// Query matching one user's runs
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Query matching all unfinished runs, the reconciliation sweep's view
    pub fn unfinished() -> Self {
        Self {
            unfinished_only: true,
            ..Self::default()
        }
    }

    /// Whether `run` matches this query
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(user_id) = &self.user_id {
            if &run.user_id != user_id {
                return false;
            }
        }
        if let Some(stages) = &self.stages {
            if !stages.contains(&run.processing_stage()) {
                return false;
            }
        }
        if self.unfinished_only && run.is_finished() {
            return false;
        }
        true
    }
}

/// Lightweight listing row for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// The run id
    pub id: Uuid,
    /// Owner of the run
    pub user_id: String,
    /// Current lifecycle stage
    pub stage: ProcessingStage,
    /// When the run was requested
    pub request_time: DateTime<Utc>,
}

/// Capability contract for run persistence.
///
/// `update_run` implements bounded compare-and-swap: a successful update
/// strictly increments `db_version`, and no update ever succeeds against a
/// stale base version without going through the resolution path.
#[async_trait]
pub trait RunDatabase: Send + Sync {
    /// Insert a fresh run. Fails with [`DatabaseError::DuplicateRun`] if
    /// the id already exists; never silently overwrites.
    async fn insert_run(&self, run: Run) -> DatabaseResult<Run>;

    /// Read one run by id
    async fn get_run(&self, id: &Uuid) -> DatabaseResult<Option<Run>>;

    /// Compare-and-swap update.
    ///
    /// On version conflict, `resolution` (if provided) merges the
    /// attempted value with the currently stored one and the write is
    /// retried, up to `max_tries` attempts in total. Without a resolution
    /// function, or once tries are exhausted, the conflict surfaces as
    /// [`DatabaseError::ConcurrentModification`].
    async fn update_run(
        &self,
        run: Run,
        resolution: Option<ResolutionFn<'_>>,
        max_tries: u32,
    ) -> DatabaseResult<Run>;

    /// Read all runs matching `query`. Each returned row is a consistent
    /// snapshot; the set as a whole need not be.
    async fn get_runs(&self, query: &RunQuery) -> DatabaseResult<Vec<Run>>;

    /// List id, stage, and request time for runs matching `query`
    async fn list_run_summaries(&self, query: &RunQuery) -> DatabaseResult<Vec<RunSummary>>;

    /// Delete one run. Returns whether it existed.
    async fn delete_run(&self, id: &Uuid) -> DatabaseResult<bool>;
}

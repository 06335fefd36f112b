//! In-memory run database
//!
//! Backs tests and single-process deployments. The per-key entry lock of
//! the underlying map makes each compare-and-swap atomic.

use super::{DatabaseError, DatabaseResult, ResolutionFn, RunDatabase, RunQuery, RunSummary};
use crate::run::Run;
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Map-backed [`RunDatabase`]
#[derive(Debug, Default)]
pub struct MemoryRunDatabase {
    runs: DashMap<Uuid, Run>,
}

impl MemoryRunDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether the database holds no runs
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// One CAS attempt. Holds the entry lock for the compare and the
    /// write, so the swap is atomic per run.
    fn try_swap(&self, mut run: Run) -> DatabaseResult<Run> {
        let mut entry = self
            .runs
            .get_mut(&run.id)
            .ok_or(DatabaseError::RunNotFound { id: run.id })?;
        let current = entry.value();
        if current.db_version != run.db_version {
            return Err(DatabaseError::ConcurrentModification {
                id: run.id,
                attempted_version: run.db_version,
                current_version: current.db_version,
                attempted: Box::new(run),
                current: Box::new(current.clone()),
            });
        }
        run.db_version += 1;
        *entry.value_mut() = run.clone();
        Ok(run)
    }
}

#[async_trait]
impl RunDatabase for MemoryRunDatabase {
    async fn insert_run(&self, mut run: Run) -> DatabaseResult<Run> {
        use dashmap::mapref::entry::Entry;
        match self.runs.entry(run.id) {
            Entry::Occupied(_) => Err(DatabaseError::DuplicateRun { id: run.id }),
            Entry::Vacant(slot) => {
                run.db_version = 1;
                slot.insert(run.clone());
                Ok(run)
            }
        }
    }

    async fn get_run(&self, id: &Uuid) -> DatabaseResult<Option<Run>> {
        Ok(self.runs.get(id).map(|entry| entry.value().clone()))
    }

    async fn update_run(
        &self,
        run: Run,
        resolution: Option<ResolutionFn<'_>>,
        max_tries: u32,
    ) -> DatabaseResult<Run> {
        let mut attempt = run;
        let mut tries = 0;
        loop {
            tries += 1;
            match self.try_swap(attempt) {
                Ok(stored) => return Ok(stored),
                Err(DatabaseError::ConcurrentModification {
                    id,
                    attempted_version,
                    current_version,
                    attempted,
                    current,
                }) => {
                    let (Some(resolve), true) = (resolution, tries < max_tries) else {
                        return Err(DatabaseError::ConcurrentModification {
                            id,
                            attempted_version,
                            current_version,
                            attempted,
                            current,
                        });
                    };
                    tracing::debug!(
                        run_id = %id,
                        attempted_version,
                        current_version,
                        "resolving concurrent run modification"
                    );
                    let mut merged = resolve(*attempted, &current);
                    // The merged value retries against the version that
                    // beat us.
                    merged.db_version = current.db_version;
                    attempt = merged;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn get_runs(&self, query: &RunQuery) -> DatabaseResult<Vec<Run>> {
        Ok(self
            .runs
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_run_summaries(&self, query: &RunQuery) -> DatabaseResult<Vec<RunSummary>> {
        Ok(self
            .runs
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| {
                let run = entry.value();
                RunSummary {
                    id: run.id,
                    user_id: run.user_id.clone(),
                    stage: run.processing_stage(),
                    request_time: run.request_time,
                }
            })
            .collect())
    }

    async fn delete_run(&self, id: &Uuid) -> DatabaseResult<bool> {
        Ok(self.runs.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{ProcessingStage, RunRequest};
    use serde_json::json;
    use std::collections::HashMap;

    fn request() -> RunRequest {
        RunRequest {
            workflow_url: "workflows/Snakefile".to_string(),
            workflow_type: "SMK".to_string(),
            workflow_type_version: "7.30.2".to_string(),
            workflow_params: json!({}),
            tags: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_first_version() {
        let db = MemoryRunDatabase::new();
        let run = db.insert_run(Run::new("alice", request())).await.unwrap();
        assert_eq!(run.db_version, 1);
        let stored = db.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored, run);
    }

    #[tokio::test]
    async fn test_insert_duplicate_fails() {
        let db = MemoryRunDatabase::new();
        let run = db.insert_run(Run::new("alice", request())).await.unwrap();
        let mut duplicate = Run::new("alice", request());
        duplicate.id = run.id;
        let err = db.insert_run(duplicate).await.unwrap_err();
        assert!(matches!(err, DatabaseError::DuplicateRun { .. }));
    }

    #[tokio::test]
    async fn test_cas_round_trip() {
        let db = MemoryRunDatabase::new();
        let mut run = db.insert_run(Run::new("alice", request())).await.unwrap();
        run.progress_to(ProcessingStage::PreparedExecution).unwrap();

        // Fresh version succeeds and increments.
        let updated = db.update_run(run.clone(), None, 1).await.unwrap();
        assert_eq!(updated.db_version, 2);

        // The exact same write again is now stale and must fail.
        let err = db.update_run(run, None, 1).await.unwrap_err();
        match err {
            DatabaseError::ConcurrentModification {
                attempted_version,
                current_version,
                attempted,
                current,
                ..
            } => {
                assert_eq!(attempted_version, 1);
                assert_eq!(current_version, 2);
                assert_eq!(attempted.db_version, 1);
                assert_eq!(current.db_version, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_update_nonexistent_run_is_distinct_error() {
        let db = MemoryRunDatabase::new();
        let run = Run::new("alice", request());
        let err = db.update_run(run, None, 3).await.unwrap_err();
        assert!(matches!(err, DatabaseError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_resolution_function_merges_and_retries() {
        let db = MemoryRunDatabase::new();
        let inserted = db.insert_run(Run::new("alice", request())).await.unwrap();

        // A concurrent writer moves the run forward.
        let mut other = inserted.clone();
        other.progress_to(ProcessingStage::PreparedExecution).unwrap();
        db.update_run(other, None, 1).await.unwrap();

        // Our stale write carries a task id; the resolution keeps the
        // stored stage and reapplies our field.
        let mut stale = inserted;
        stale.task_id = Some("task-42".to_string());
        let resolve: ResolutionFn<'_> = &|attempted: Run, current: &Run| {
            let mut merged = current.clone();
            merged.task_id = attempted.task_id.clone();
            merged
        };
        let stored = db.update_run(stale, Some(resolve), 3).await.unwrap();
        assert_eq!(stored.db_version, 3);
        assert_eq!(stored.task_id.as_deref(), Some("task-42"));
        assert_eq!(
            stored.processing_stage(),
            ProcessingStage::PreparedExecution
        );
    }

    #[tokio::test]
    async fn test_resolution_is_bounded_by_max_tries() {
        let db = MemoryRunDatabase::new();
        let inserted = db.insert_run(Run::new("alice", request())).await.unwrap();
        let mut stale = inserted.clone();
        stale.db_version = 99;

        // With a single try the conflict surfaces without invoking the
        // resolution function at all.
        let resolve: ResolutionFn<'_> =
            &|_attempted: Run, _current: &Run| panic!("resolution must not run");
        let err = db.update_run(stale, Some(resolve), 1).await.unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::ConcurrentModification { .. }
        ));
    }

    #[tokio::test]
    async fn test_queries_filter_by_user_stage_and_liveness() {
        let db = MemoryRunDatabase::new();
        let a = db.insert_run(Run::new("alice", request())).await.unwrap();
        let mut b = Run::new("bob", request());
        b.progress_to(ProcessingStage::FinishedExecution).unwrap();
        db.insert_run(b).await.unwrap();

        let alices = db.get_runs(&RunQuery::for_user("alice")).await.unwrap();
        assert_eq!(alices.len(), 1);
        assert_eq!(alices[0].id, a.id);

        let unfinished = db.get_runs(&RunQuery::unfinished()).await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, a.id);

        let created = db
            .get_runs(&RunQuery {
                stages: Some(vec![ProcessingStage::RunCreated]),
                ..RunQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(created.len(), 1);

        let summaries = db.list_run_summaries(&RunQuery::all()).await.unwrap();
        assert_eq!(summaries.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_run() {
        let db = MemoryRunDatabase::new();
        let run = db.insert_run(Run::new("alice", request())).await.unwrap();
        assert!(db.delete_run(&run.id).await.unwrap());
        assert!(!db.delete_run(&run.id).await.unwrap());
        assert!(db.get_run(&run.id).await.unwrap().is_none());
    }
}

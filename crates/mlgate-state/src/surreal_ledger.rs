//! SurrealDB-backed RunLedger implementation
//!
//! Uses `schema::RunRow` for persistence, converting to/from
//! `storage_traits` types at the boundary. Every mutation is a
//! read-modify-write under the handle's write lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::handle::SurrealHandle;
use crate::schema::RunRow;
use crate::storage_traits::{
    ArtifactRef, NewRun, RunId, RunLedger, RunRecord, RunStatus, StorageResult,
    FAILURE_REASON_TAG,
};

/// SurrealDB-backed implementation of [`RunLedger`].
#[derive(Debug, Clone)]
pub struct SurrealRunLedger {
    handle: SurrealHandle,
}

impl SurrealRunLedger {
    pub fn new(handle: SurrealHandle) -> Self {
        Self { handle }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let handle = SurrealHandle::in_memory().await?;
        info!("SurrealRunLedger connected (in-memory)");
        Ok(Self::new(handle))
    }

    // -- private helpers -----------------------------------------------------

    /// Fetch a run row by ID, returning the record or RunNotFound.
    async fn fetch_run(&self, rid: &str) -> StorageResult<RunRecord> {
        let rid_owned = rid.to_string();
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM runs WHERE run_id = $rid")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<RunRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: rid.to_string(),
            })
            .and_then(RunRecord::try_from)
    }

    async fn store_run(&self, record: &RunRecord) -> StorageResult<()> {
        let row = RunRow::from(record);
        let rid_owned = record.run_id.0.clone();

        self.handle
            .db()
            .query("UPDATE runs CONTENT $row WHERE run_id = $rid")
            .bind(("row", row))
            .bind(("rid", rid_owned))
            .await
            .and_then(|res| res.check())
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    /// Load a running record, apply `f`, refresh the heartbeat and persist.
    async fn mutate_running<F>(&self, run_id: &RunId, f: F) -> StorageResult<RunRecord>
    where
        F: FnOnce(&mut RunRecord, DateTime<Utc>) + Send,
    {
        let _guard = self.handle.write_guard().await;
        let mut record = self.fetch_run(&run_id.0).await?;
        record.ensure_running()?;

        let now = Utc::now();
        f(&mut record, now);
        record.last_heartbeat_at = now;

        self.store_run(&record).await?;
        Ok(record)
    }
}

#[async_trait]
impl RunLedger for SurrealRunLedger {
    #[instrument(skip(self, new_run), fields(experiment = %new_run.experiment))]
    async fn create_run(&self, new_run: NewRun) -> StorageResult<RunRecord> {
        let record = RunRecord::start(RunId::new(), new_run, Utc::now());
        debug!(run_id = %record.run_id, "creating run");

        let created: Option<RunRow> = self
            .handle
            .db()
            .create("runs")
            .content(RunRow::from(&record))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        created
            .ok_or_else(|| StorageError::Backend("failed to create run record".to_string()))
            .and_then(RunRecord::try_from)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn log_metric(&self, run_id: &RunId, name: &str, value: f64) -> StorageResult<()> {
        let name = name.to_string();
        self.mutate_running(run_id, move |record, _| {
            record.metrics.insert(name, value);
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id, artifact = %artifact))]
    async fn log_artifact(&self, run_id: &RunId, artifact: &ArtifactRef) -> StorageResult<()> {
        let artifact = artifact.clone();
        self.mutate_running(run_id, move |record, _| {
            if !record.artifacts.contains(&artifact) {
                record.artifacts.push(artifact);
            }
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id, status = %status))]
    async fn finish_run(&self, run_id: &RunId, status: RunStatus) -> StorageResult<RunRecord> {
        if !status.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: status.to_string(),
                expected: "FINISHED or FAILED".to_string(),
            });
        }
        self.mutate_running(run_id, move |record, now| {
            record.status = status;
            record.ended_at = Some(now);
        })
        .await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.fetch_run(&run_id.0).await
    }

    async fn list_runs(&self, experiment: Option<&str>) -> StorageResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = if let Some(experiment) = experiment {
            let exp = experiment.to_string();
            let mut res = self
                .handle
                .db()
                .query("SELECT * FROM runs WHERE experiment = $exp ORDER BY started_at ASC")
                .bind(("exp", exp))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            let mut res = self
                .handle
                .db()
                .query("SELECT * FROM runs ORDER BY started_at ASC")
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(RunRecord::try_from).collect()
    }

    #[instrument(skip(self), fields(cutoff = %cutoff))]
    async fn expire_stale_runs(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<RunId>> {
        let _guard = self.handle.write_guard().await;

        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM runs WHERE status = $status")
            .bind(("status", RunStatus::Running.as_str().to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<RunRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let now = Utc::now();
        let mut expired = Vec::new();
        for row in rows {
            let mut record = RunRecord::try_from(row)?;
            if record.last_heartbeat_at >= cutoff {
                continue;
            }
            record.status = RunStatus::Failed;
            record.ended_at = Some(now);
            record
                .tags
                .insert(FAILURE_REASON_TAG.to_string(), "lease_expired".to_string());
            self.store_run(&record).await?;
            expired.push(record.run_id);
        }

        expired.sort();
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale runs");
        }
        Ok(expired)
    }
}

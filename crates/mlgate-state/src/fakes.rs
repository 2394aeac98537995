//! In-memory fakes for storage traits
//!
//! Provides `MemoryCasStore`, `MemoryRunLedger`, and `MemoryModelRegistry`
//! that satisfy the trait contracts without any external dependencies.
//! `MemoryCasStore` also holds the blobs of an ephemeral `mem://` registry.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryCasStore
// ---------------------------------------------------------------------------

/// In-memory content-addressed store backed by a `HashMap<digest, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryCasStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCasStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CasStore for MemoryCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let mut store = self.store.lock().unwrap();
        store.insert(digest.as_str().to_string(), data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let store = self.store.lock().unwrap();
        store
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                digest: digest.as_str().to_string(),
            })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        let store = self.store.lock().unwrap();
        Ok(store.contains_key(digest.as_str()))
    }
}

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

/// In-memory run ledger backed by a `HashMap<RunId, RunRecord>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, RunRecord>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to a running record, refreshing its heartbeat.
    fn with_running<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunRecord, DateTime<Utc>) -> T,
    ) -> StorageResult<T> {
        let mut runs = self.runs.lock().unwrap();
        let record = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        record.ensure_running()?;
        let now = Utc::now();
        record.last_heartbeat_at = now;
        Ok(f(record, now))
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(&self, new_run: NewRun) -> StorageResult<RunRecord> {
        let record = RunRecord::start(RunId::new(), new_run, Utc::now());
        let mut runs = self.runs.lock().unwrap();
        runs.insert(record.run_id.0.clone(), record.clone());
        Ok(record)
    }

    async fn log_metric(&self, run_id: &RunId, name: &str, value: f64) -> StorageResult<()> {
        self.with_running(run_id, |record, _| {
            record.metrics.insert(name.to_string(), value);
        })
    }

    async fn log_artifact(&self, run_id: &RunId, artifact: &ArtifactRef) -> StorageResult<()> {
        self.with_running(run_id, |record, _| {
            if !record.artifacts.contains(artifact) {
                record.artifacts.push(artifact.clone());
            }
        })
    }

    async fn finish_run(&self, run_id: &RunId, status: RunStatus) -> StorageResult<RunRecord> {
        if !status.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: status.to_string(),
                expected: "FINISHED or FAILED".to_string(),
            });
        }
        self.with_running(run_id, |record, now| {
            record.status = status;
            record.ended_at = Some(now);
            record.clone()
        })
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list_runs(&self, experiment: Option<&str>) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|r| experiment.map_or(true, |e| r.experiment == e))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    async fn expire_stale_runs(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<RunId>> {
        let mut runs = self.runs.lock().unwrap();
        let now = Utc::now();
        let mut expired = Vec::new();
        for record in runs.values_mut() {
            if record.status == RunStatus::Running && record.last_heartbeat_at < cutoff {
                record.status = RunStatus::Failed;
                record.ended_at = Some(now);
                record
                    .tags
                    .insert(FAILURE_REASON_TAG.to_string(), "lease_expired".to_string());
                expired.push(record.run_id.clone());
            }
        }
        expired.sort();
        Ok(expired)
    }
}

// ---------------------------------------------------------------------------
// MemoryModelRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ModelState {
    model: RegisteredModel,
    versions: Vec<ModelVersion>,
}

/// In-memory model registry backed by a `HashMap<name, ModelState>`.
///
/// A single mutex guards every model, so registration and stage moves are
/// trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryModelRegistry {
    models: Mutex<HashMap<String, ModelState>>,
}

impl MemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_version<'a>(
    state: &'a mut ModelState,
    name: &str,
    version: u64,
) -> StorageResult<&'a mut ModelVersion> {
    state
        .versions
        .iter_mut()
        .find(|v| v.version == version)
        .ok_or_else(|| StorageError::VersionNotFound {
            name: name.to_string(),
            version,
        })
}

#[async_trait]
impl ModelRegistry for MemoryModelRegistry {
    async fn register_version(
        &self,
        name: &str,
        run_id: &RunId,
        artifact: &ArtifactRef,
        target_stage: Stage,
        policy: DemotionPolicy,
    ) -> StorageResult<ModelVersion> {
        let now = Utc::now();
        let mut models = self.models.lock().unwrap();
        let state = models.entry(name.to_string()).or_insert_with(|| ModelState {
            model: RegisteredModel {
                name: name.to_string(),
                description: None,
                created_at: now,
                latest_version: 0,
            },
            versions: Vec::new(),
        });

        let version = state.model.latest_version + 1;
        state.versions.push(ModelVersion {
            name: name.to_string(),
            version,
            run_id: run_id.clone(),
            stage: Stage::None,
            artifact: artifact.clone(),
            description: None,
            created_at: now,
            stage_updated_at: now,
        });
        state.model.latest_version = version;

        if target_stage != Stage::None {
            apply_stage_transition(name, &mut state.versions, version, target_stage, policy, now)?;
        }
        Ok(find_version(state, name, version)?.clone())
    }

    async fn transition_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        policy: DemotionPolicy,
    ) -> StorageResult<ModelVersion> {
        let mut models = self.models.lock().unwrap();
        let state = models
            .get_mut(name)
            .ok_or_else(|| StorageError::ModelNotFound {
                name: name.to_string(),
            })?;
        apply_stage_transition(name, &mut state.versions, version, stage, policy, Utc::now())?;
        Ok(find_version(state, name, version)?.clone())
    }

    async fn get_version(&self, name: &str, version: u64) -> StorageResult<ModelVersion> {
        let mut models = self.models.lock().unwrap();
        let state = models
            .get_mut(name)
            .ok_or_else(|| StorageError::ModelNotFound {
                name: name.to_string(),
            })?;
        Ok(find_version(state, name, version)?.clone())
    }

    async fn list_versions(&self, name: &str) -> StorageResult<Vec<ModelVersion>> {
        let models = self.models.lock().unwrap();
        Ok(models
            .get(name)
            .map(|s| s.versions.clone())
            .unwrap_or_default())
    }

    async fn update_description(
        &self,
        name: &str,
        version: u64,
        description: Option<String>,
    ) -> StorageResult<ModelVersion> {
        let mut models = self.models.lock().unwrap();
        let state = models
            .get_mut(name)
            .ok_or_else(|| StorageError::ModelNotFound {
                name: name.to_string(),
            })?;
        let v = find_version(state, name, version)?;
        v.description = description;
        Ok(v.clone())
    }

    async fn get_model(&self, name: &str) -> StorageResult<Option<RegisteredModel>> {
        let models = self.models.lock().unwrap();
        Ok(models.get(name).map(|s| s.model.clone()))
    }

    async fn list_models(&self) -> StorageResult<Vec<RegisteredModel>> {
        let models = self.models.lock().unwrap();
        let mut out: Vec<RegisteredModel> = models.values().map(|s| s.model.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

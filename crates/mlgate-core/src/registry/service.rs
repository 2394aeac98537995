//! Embedded registry: the single logical owner of runs, versions and blobs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mlgate_state::fakes::MemoryCasStore;
use mlgate_state::{
    ArtifactRef, CasStore, DemotionPolicy, FsCasStore, ModelRegistry, ModelVersion, NewRun,
    RegisteredModel, RunId, RunLedger, RunRecord, RunStatus, Stage, SurrealHandle,
    SurrealModelRegistry, SurrealRunLedger,
};
use tracing::{info, instrument};

use crate::domain::error::{PipelineError, Result};
use crate::promotion::{validate_model_name, PromotionRequest};
use crate::registry::{LeaseSweeper, RegistryApi};

/// Registry backed by the state crate's stores.
///
/// Writes are serialized by the stores themselves (the Surreal backends
/// share one write lock through their handle).
#[derive(Clone)]
pub struct RegistryService {
    runs: Arc<dyn RunLedger>,
    models: Arc<dyn ModelRegistry>,
    blobs: Arc<dyn CasStore>,
}

impl RegistryService {
    pub fn new(
        runs: Arc<dyn RunLedger>,
        models: Arc<dyn ModelRegistry>,
        blobs: Arc<dyn CasStore>,
    ) -> Self {
        Self {
            runs,
            models,
            blobs,
        }
    }

    /// Open an embedded registry.
    ///
    /// `mem://` keeps everything in memory. `surrealkv://<dir>` keeps the
    /// database under `<dir>/db` and artifact blobs under `<dir>/artifacts`.
    pub async fn open(uri: &str) -> Result<Self> {
        if uri == "mem://" {
            let handle = SurrealHandle::in_memory().await?;
            info!("opened in-memory registry");
            return Ok(Self::from_handle(handle, Arc::new(MemoryCasStore::new())));
        }

        let Some(root) = uri.strip_prefix("surrealkv://").filter(|r| !r.is_empty()) else {
            return Err(PipelineError::Fatal(format!(
                "unsupported embedded registry uri '{uri}'"
            )));
        };
        let root = Path::new(root);
        let handle = SurrealHandle::connect(&format!("surrealkv://{}", root.join("db").display()))
            .await?;
        let blobs = FsCasStore::new(root.join("artifacts"))?;
        info!(root = %root.display(), "opened durable registry");
        Ok(Self::from_handle(handle, Arc::new(blobs)))
    }

    fn from_handle(handle: SurrealHandle, blobs: Arc<dyn CasStore>) -> Self {
        Self::new(
            Arc::new(SurrealRunLedger::new(handle.clone())),
            Arc::new(SurrealModelRegistry::new(handle)),
            blobs,
        )
    }

    /// Sweeper failing this registry's runs once `lease` passes without a heartbeat.
    pub fn lease_sweeper(&self, lease: Duration) -> LeaseSweeper {
        LeaseSweeper::new(self.runs.clone(), lease)
    }
}

#[async_trait]
impl RegistryApi for RegistryService {
    async fn health(&self) -> Result<()> {
        self.models.get_model("").await?;
        Ok(())
    }

    #[instrument(skip(self, new_run), fields(experiment = %new_run.experiment))]
    async fn create_run(&self, new_run: NewRun) -> Result<RunRecord> {
        if new_run.experiment.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "experiment name must not be empty".to_string(),
            ));
        }
        Ok(self.runs.create_run(new_run).await?)
    }

    async fn log_metric(&self, run_id: &RunId, name: &str, value: f64) -> Result<()> {
        if name.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "metric name must not be empty".to_string(),
            ));
        }
        if !value.is_finite() {
            return Err(PipelineError::InvalidInput(format!(
                "metric '{name}' must be finite, got {value}"
            )));
        }
        Ok(self.runs.log_metric(run_id, name, value).await?)
    }

    async fn log_artifact(&self, run_id: &RunId, artifact: &ArtifactRef) -> Result<()> {
        Ok(self.runs.log_artifact(run_id, artifact).await?)
    }

    async fn finish_run(&self, run_id: &RunId, status: RunStatus) -> Result<RunRecord> {
        if !status.is_terminal() {
            return Err(PipelineError::InvalidInput(format!(
                "cannot finish a run with status {status}"
            )));
        }
        Ok(self.runs.finish_run(run_id, status).await?)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord> {
        Ok(self.runs.get_run(run_id).await?)
    }

    async fn list_runs(&self, experiment: Option<&str>) -> Result<Vec<RunRecord>> {
        Ok(self.runs.list_runs(experiment).await?)
    }

    async fn upload_artifact(&self, bytes: Vec<u8>) -> Result<ArtifactRef> {
        let digest = self.blobs.put(&bytes).await?;
        Ok(ArtifactRef::cas(&digest))
    }

    async fn download_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        let digest = artifact.digest().ok_or_else(|| {
            PipelineError::InvalidInput(format!(
                "artifact '{artifact}' is not held by this registry"
            ))
        })?;
        Ok(self.blobs.get(&digest).await?)
    }

    #[instrument(skip(self, request), fields(name = %request.name, run_id = %request.run_id))]
    async fn register_and_promote(&self, request: &PromotionRequest) -> Result<ModelVersion> {
        validate_model_name(&request.name)?;

        let run = self.runs.get_run(&request.run_id).await?;
        if run.status != RunStatus::Finished {
            return Err(PipelineError::RunNotFinished(format!(
                "run {} is {}",
                run.run_id, run.status
            )));
        }
        if let Some(digest) = request.artifact.digest() {
            if !self.blobs.contains(&digest).await? {
                return Err(PipelineError::NotFound(format!(
                    "artifact {} has not been uploaded",
                    request.artifact
                )));
            }
        }

        Ok(self
            .models
            .register_version(
                &request.name,
                &request.run_id,
                &request.artifact,
                request.target_stage,
                request.policy,
            )
            .await?)
    }

    async fn transition_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        policy: DemotionPolicy,
    ) -> Result<ModelVersion> {
        Ok(self
            .models
            .transition_stage(name, version, stage, policy)
            .await?)
    }

    async fn get_version(&self, name: &str, version: u64) -> Result<ModelVersion> {
        Ok(self.models.get_version(name, version).await?)
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        Ok(self.models.list_versions(name).await?)
    }

    async fn get_latest_versions(
        &self,
        name: &str,
        stages: Option<&[Stage]>,
    ) -> Result<Vec<ModelVersion>> {
        let versions = self.models.list_versions(name).await?;
        if versions.is_empty() && self.models.get_model(name).await?.is_none() {
            return Err(PipelineError::NotFound(format!(
                "registered model not found: {name}"
            )));
        }

        let stages = stages.unwrap_or(&Stage::ALL);
        Ok(stages
            .iter()
            .filter_map(|stage| ModelVersion::latest_in_stage(&versions, *stage).cloned())
            .collect())
    }

    async fn update_version_description(
        &self,
        name: &str,
        version: u64,
        description: Option<String>,
    ) -> Result<ModelVersion> {
        Ok(self
            .models
            .update_description(name, version, description)
            .await?)
    }

    async fn list_models(&self) -> Result<Vec<RegisteredModel>> {
        Ok(self.models.list_models().await?)
    }
}

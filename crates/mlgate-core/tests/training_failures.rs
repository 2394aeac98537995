//! Training job behaviour when the registry misbehaves part-way through.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use mlgate_core::promotion::PromotionRequest;
use mlgate_core::registry::{RegistryApi, RegistryService};
use mlgate_core::{
    run_training, ArtifactRef, DemotionPolicy, ModelVersion, NewRun, PipelineError,
    RegisteredModel, Result, RunId, RunRecord, RunStatus, Stage, TrainingConfig,
};

/// Delegates to an in-memory registry, failing selected calls.
struct FaultyRegistry {
    inner: RegistryService,
    fail_upload: AtomicBool,
    fail_describe: AtomicBool,
}

impl FaultyRegistry {
    async fn new() -> Self {
        Self {
            inner: RegistryService::open("mem://").await.unwrap(),
            fail_upload: AtomicBool::new(false),
            fail_describe: AtomicBool::new(false),
        }
    }

    fn injected(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(PipelineError::TransientConnectivity(format!(
                "injected {what} failure"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryApi for FaultyRegistry {
    async fn health(&self) -> Result<()> {
        self.inner.health().await
    }

    async fn create_run(&self, new_run: NewRun) -> Result<RunRecord> {
        self.inner.create_run(new_run).await
    }

    async fn log_metric(&self, run_id: &RunId, name: &str, value: f64) -> Result<()> {
        self.inner.log_metric(run_id, name, value).await
    }

    async fn log_artifact(&self, run_id: &RunId, artifact: &ArtifactRef) -> Result<()> {
        self.inner.log_artifact(run_id, artifact).await
    }

    async fn finish_run(&self, run_id: &RunId, status: RunStatus) -> Result<RunRecord> {
        self.inner.finish_run(run_id, status).await
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, experiment: Option<&str>) -> Result<Vec<RunRecord>> {
        self.inner.list_runs(experiment).await
    }

    async fn upload_artifact(&self, bytes: Vec<u8>) -> Result<ArtifactRef> {
        Self::injected(&self.fail_upload, "upload")?;
        self.inner.upload_artifact(bytes).await
    }

    async fn download_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        self.inner.download_artifact(artifact).await
    }

    async fn register_and_promote(&self, request: &PromotionRequest) -> Result<ModelVersion> {
        self.inner.register_and_promote(request).await
    }

    async fn transition_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        policy: DemotionPolicy,
    ) -> Result<ModelVersion> {
        self.inner
            .transition_stage(name, version, stage, policy)
            .await
    }

    async fn get_version(&self, name: &str, version: u64) -> Result<ModelVersion> {
        self.inner.get_version(name, version).await
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        self.inner.list_versions(name).await
    }

    async fn get_latest_versions(
        &self,
        name: &str,
        stages: Option<&[Stage]>,
    ) -> Result<Vec<ModelVersion>> {
        self.inner.get_latest_versions(name, stages).await
    }

    async fn update_version_description(
        &self,
        name: &str,
        version: u64,
        description: Option<String>,
    ) -> Result<ModelVersion> {
        Self::injected(&self.fail_describe, "describe")?;
        self.inner
            .update_version_description(name, version, description)
            .await
    }

    async fn list_models(&self) -> Result<Vec<RegisteredModel>> {
        self.inner.list_models().await
    }
}

fn config(dir: &std::path::Path) -> TrainingConfig {
    TrainingConfig {
        experiment: "faults".into(),
        test_data: dir.join("test.json"),
        samples: 120,
        features: 3,
        ..TrainingConfig::default()
    }
}

#[tokio::test]
async fn failed_upload_marks_run_failed_and_registers_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FaultyRegistry::new().await;
    registry.fail_upload.store(true, Ordering::SeqCst);

    let err = run_training(&registry, &config(dir.path()))
        .await
        .unwrap_err();
    assert!(err.retryable(), "{err}");

    let runs = registry.list_runs(Some("faults")).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].metrics.contains_key("accuracy_test"));
    assert!(runs[0].artifacts.is_empty());
    assert!(registry.list_versions("clf-model").await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_description_keeps_the_promotion() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FaultyRegistry::new().await;
    registry.fail_describe.store(true, Ordering::SeqCst);

    let outcome = run_training(&registry, &config(dir.path())).await.unwrap();
    assert_eq!(outcome.version.stage, Stage::Staging);
    assert!(outcome.version.description.is_none());

    let run = registry.get_run(&outcome.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Finished);
}

#[tokio::test]
async fn production_target_with_archive_policy() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FaultyRegistry::new().await;
    let config = TrainingConfig {
        target_stage: Stage::Production,
        demotion: DemotionPolicy::ToArchived,
        ..config(dir.path())
    };

    run_training(&registry, &config).await.unwrap();
    run_training(&registry, &config).await.unwrap();

    let latest = registry
        .get_latest_versions("clf-model", None)
        .await
        .unwrap();
    let by_stage: Vec<(Stage, u64)> = latest.iter().map(|v| (v.stage, v.version)).collect();
    assert!(by_stage.contains(&(Stage::Production, 2)));
    assert!(by_stage.contains(&(Stage::Archived, 1)));
}

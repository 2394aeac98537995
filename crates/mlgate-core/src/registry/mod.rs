//! Registry API: one trait, two transports.
//!
//! [`RegistryService`] owns the stores and is embedded in the registry
//! daemon (and in the self-contained training variant).
//! [`HttpRegistryClient`] speaks the same API to a remote daemon. Training
//! and serving only see `Arc<dyn RegistryApi>` from [`open_registry`].

pub mod client;
pub mod lease;
pub mod server;
pub mod service;
pub mod wire;

use std::sync::Arc;

use async_trait::async_trait;
use mlgate_state::{
    ArtifactRef, DemotionPolicy, ModelVersion, NewRun, RegisteredModel, RunId, RunRecord,
    RunStatus, Stage,
};

use crate::domain::error::{PipelineError, Result};
use crate::promotion::PromotionRequest;

pub use client::HttpRegistryClient;
pub use lease::LeaseSweeper;
pub use server::{registry_router, serve};
pub use service::RegistryService;

/// Operations the pipeline processes perform against the registry.
///
/// Connection failures surface as `TransientConnectivity`; an absent
/// entity is `NotFound`. Callers rely on the two being distinct.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Cheap readiness check of the registry and its store.
    async fn health(&self) -> Result<()>;

    async fn create_run(&self, new_run: NewRun) -> Result<RunRecord>;

    async fn log_metric(&self, run_id: &RunId, name: &str, value: f64) -> Result<()>;

    async fn log_artifact(&self, run_id: &RunId, artifact: &ArtifactRef) -> Result<()>;

    async fn finish_run(&self, run_id: &RunId, status: RunStatus) -> Result<RunRecord>;

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord>;

    async fn list_runs(&self, experiment: Option<&str>) -> Result<Vec<RunRecord>>;

    /// Store model bytes; returns their `cas://` reference.
    async fn upload_artifact(&self, bytes: Vec<u8>) -> Result<ArtifactRef>;

    async fn download_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>>;

    /// Register a new version of a finished run's artifact and move it to
    /// the requested stage in one step.
    async fn register_and_promote(&self, request: &PromotionRequest) -> Result<ModelVersion>;

    async fn transition_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        policy: DemotionPolicy,
    ) -> Result<ModelVersion>;

    async fn get_version(&self, name: &str, version: u64) -> Result<ModelVersion>;

    /// All versions in ascending order; empty for an unknown name.
    async fn list_versions(&self, name: &str) -> Result<Vec<ModelVersion>>;

    /// The latest version per requested stage (all stages when `None`).
    /// Stages nobody occupies are omitted.
    async fn get_latest_versions(
        &self,
        name: &str,
        stages: Option<&[Stage]>,
    ) -> Result<Vec<ModelVersion>>;

    async fn update_version_description(
        &self,
        name: &str,
        version: u64,
        description: Option<String>,
    ) -> Result<ModelVersion>;

    async fn list_models(&self) -> Result<Vec<RegisteredModel>>;
}

/// Open the registry named by `uri`.
///
/// - `http://` / `https://`: remote registry daemon
/// - `mem://`: embedded, ephemeral
/// - `surrealkv://<dir>`: embedded, durable under `<dir>`
pub async fn open_registry(uri: &str) -> Result<Arc<dyn RegistryApi>> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        Ok(Arc::new(HttpRegistryClient::new(uri)?))
    } else if uri.starts_with("mem://") || uri.starts_with("surrealkv://") {
        Ok(Arc::new(RegistryService::open(uri).await?))
    } else {
        Err(PipelineError::Fatal(format!(
            "unsupported registry uri '{uri}' (expected http(s)://, mem:// or surrealkv://)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_scheme_is_fatal() {
        let err = open_registry("ftp://registry").await.err().unwrap();
        assert!(matches!(err, PipelineError::Fatal(_)));
        assert_eq!(err.exit_code(), 78);
    }

    #[tokio::test]
    async fn mem_uri_opens_embedded_registry() {
        let api = open_registry("mem://").await.unwrap();
        api.health().await.unwrap();
        assert!(api.list_models().await.unwrap().is_empty());
    }
}

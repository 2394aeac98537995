//! HTTP transport for [`RegistryApi`], talking to `mlgate-registryd`.

use std::time::Duration;

use async_trait::async_trait;
use mlgate_state::{
    ArtifactRef, DemotionPolicy, ModelVersion, NewRun, RegisteredModel, RunId, RunRecord,
    RunStatus, Stage,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::domain::error::{PipelineError, Result};
use crate::promotion::PromotionRequest;
use crate::registry::wire::{
    error_from_status, ErrorBody, FinishRunRequest, LogArtifactRequest, LogMetricRequest,
    RegisterVersionRequest, TransitionStageRequest, UpdateVersionRequest, UploadResponse,
};
use crate::registry::RegistryApi;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote registry client.
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    base_url: String,
    http: Client,
}

impl HttpRegistryClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// `timeout` bounds each request, connection setup included.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(PipelineError::Fatal(format!(
                "registry url must be http(s): '{base_url}'"
            )));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Fatal(format!("failed to build http client: {e}")))?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.json::<ErrorBody>().await.ok();
        debug!(status = status.as_u16(), ?body, "registry request failed");
        Err(error_from_status(status.as_u16(), body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.send(request).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<()> {
        self.send(request).await.map(|_| ())
    }
}

fn segment(raw: &str) -> String {
    // Model names are restricted to URL-safe characters; run ids are hex.
    raw.replace('/', "%2F")
}

#[async_trait]
impl RegistryApi for HttpRegistryClient {
    async fn health(&self) -> Result<()> {
        self.send_empty(self.http.get(self.url("/health"))).await
    }

    async fn create_run(&self, new_run: NewRun) -> Result<RunRecord> {
        self.send_json(self.http.post(self.url("/api/v1/runs")).json(&new_run))
            .await
    }

    async fn log_metric(&self, run_id: &RunId, name: &str, value: f64) -> Result<()> {
        let body = LogMetricRequest {
            name: name.to_string(),
            value,
        };
        let path = format!("/api/v1/runs/{}/metrics", segment(&run_id.0));
        self.send_empty(self.http.post(self.url(&path)).json(&body))
            .await
    }

    async fn log_artifact(&self, run_id: &RunId, artifact: &ArtifactRef) -> Result<()> {
        let body = LogArtifactRequest {
            artifact: artifact.clone(),
        };
        let path = format!("/api/v1/runs/{}/artifacts", segment(&run_id.0));
        self.send_empty(self.http.post(self.url(&path)).json(&body))
            .await
    }

    async fn finish_run(&self, run_id: &RunId, status: RunStatus) -> Result<RunRecord> {
        let path = format!("/api/v1/runs/{}/finish", segment(&run_id.0));
        self.send_json(
            self.http
                .post(self.url(&path))
                .json(&FinishRunRequest { status }),
        )
        .await
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord> {
        let path = format!("/api/v1/runs/{}", segment(&run_id.0));
        self.send_json(self.http.get(self.url(&path))).await
    }

    async fn list_runs(&self, experiment: Option<&str>) -> Result<Vec<RunRecord>> {
        let mut request = self.http.get(self.url("/api/v1/runs"));
        if let Some(experiment) = experiment {
            request = request.query(&[("experiment", experiment)]);
        }
        self.send_json(request).await
    }

    async fn upload_artifact(&self, bytes: Vec<u8>) -> Result<ArtifactRef> {
        let response: UploadResponse = self
            .send_json(
                self.http
                    .put(self.url("/api/v1/artifacts"))
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(bytes),
            )
            .await?;
        Ok(response.artifact)
    }

    async fn download_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        let digest = artifact.digest().ok_or_else(|| {
            PipelineError::InvalidInput(format!(
                "artifact '{artifact}' is not held by the registry"
            ))
        })?;
        let path = format!("/api/v1/artifacts/{digest}");
        let response = self.send(self.http.get(self.url(&path))).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn register_and_promote(&self, request: &PromotionRequest) -> Result<ModelVersion> {
        let body = RegisterVersionRequest {
            run_id: request.run_id.clone(),
            artifact: request.artifact.clone(),
            stage: request.target_stage,
            demotion: request.policy,
        };
        let path = format!("/api/v1/models/{}/versions", segment(&request.name));
        self.send_json(self.http.post(self.url(&path)).json(&body))
            .await
    }

    async fn transition_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        policy: DemotionPolicy,
    ) -> Result<ModelVersion> {
        let body = TransitionStageRequest {
            stage,
            demotion: policy,
        };
        let path = format!("/api/v1/models/{}/versions/{version}/stage", segment(name));
        self.send_json(self.http.post(self.url(&path)).json(&body))
            .await
    }

    async fn get_version(&self, name: &str, version: u64) -> Result<ModelVersion> {
        let path = format!("/api/v1/models/{}/versions/{version}", segment(name));
        self.send_json(self.http.get(self.url(&path))).await
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let path = format!("/api/v1/models/{}/versions", segment(name));
        self.send_json(self.http.get(self.url(&path))).await
    }

    async fn get_latest_versions(
        &self,
        name: &str,
        stages: Option<&[Stage]>,
    ) -> Result<Vec<ModelVersion>> {
        let path = format!("/api/v1/models/{}/latest", segment(name));
        let mut request = self.http.get(self.url(&path));
        if let Some(stages) = stages {
            let joined = stages
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",");
            request = request.query(&[("stages", joined)]);
        }
        self.send_json(request).await
    }

    async fn update_version_description(
        &self,
        name: &str,
        version: u64,
        description: Option<String>,
    ) -> Result<ModelVersion> {
        let path = format!("/api/v1/models/{}/versions/{version}", segment(name));
        self.send_json(
            self.http
                .patch(self.url(&path))
                .json(&UpdateVersionRequest { description }),
        )
        .await
    }

    async fn list_models(&self) -> Result<Vec<RegisteredModel>> {
        self.send_json(self.http.get(self.url("/api/v1/models")))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = HttpRegistryClient::new("http://localhost:5000/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:5000");
        assert_eq!(
            client.url("/api/v1/models"),
            "http://localhost:5000/api/v1/models"
        );
    }

    #[test]
    fn non_http_url_is_fatal() {
        let err = HttpRegistryClient::new("localhost:5000").unwrap_err();
        assert!(matches!(err, PipelineError::Fatal(_)));
    }

    #[tokio::test]
    async fn unreachable_registry_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = HttpRegistryClient::with_timeout(
            &format!("http://127.0.0.1:{port}"),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = client.list_models().await.unwrap_err();
        assert!(matches!(err, PipelineError::TransientConnectivity(_)));
        assert!(err.retryable());
    }
}

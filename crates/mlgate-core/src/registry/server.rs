//! HTTP front of the registry (`mlgate-registryd`).
//!
//! The router is generic over [`RegistryApi`] so the same handlers serve an
//! embedded [`RegistryService`](super::RegistryService) in the daemon and in
//! end-to-end tests.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use mlgate_state::{ArtifactRef, ContentDigest, ModelVersion, NewRun, RegisteredModel, RunId, RunRecord};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::domain::error::{PipelineError, Result};
use crate::promotion::PromotionRequest;
use crate::registry::wire::{
    parse_stage_list, ErrorBody, FinishRunRequest, HealthResponse, LatestQuery, ListRunsQuery,
    LogArtifactRequest, LogMetricRequest, RegisterVersionRequest, TransitionStageRequest,
    UpdateVersionRequest, UploadResponse,
};
use crate::registry::RegistryApi;

/// Largest artifact accepted by `PUT /api/v1/artifacts`.
pub const MAX_ARTIFACT_BYTES: usize = 64 * 1024 * 1024;

type ApiState = Arc<dyn RegistryApi>;

impl PipelineError {
    fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::NotFound(_)
            | PipelineError::ModelNotRegisteredYet { .. }
            | PipelineError::StageEmpty { .. } => StatusCode::NOT_FOUND,
            PipelineError::Conflict(_) | PipelineError::RunNotFinished(_) => StatusCode::CONFLICT,
            PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::TransientConnectivity(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Fatal(_) | PipelineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = %self, "registry request failed");
        }
        (status, Json(ErrorBody::from(&self))).into_response()
    }
}

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(v)| v)
        .map_err(|rejection| PipelineError::InvalidInput(rejection.body_text()))
}

/// Build the registry router over `api`.
pub fn registry_router(api: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/runs", post(create_run).get(list_runs))
        .route("/api/v1/runs/{run_id}", get(get_run))
        .route("/api/v1/runs/{run_id}/metrics", post(log_metric))
        .route("/api/v1/runs/{run_id}/artifacts", post(log_artifact))
        .route("/api/v1/runs/{run_id}/finish", post(finish_run))
        .route(
            "/api/v1/artifacts",
            put(upload_artifact).layer(DefaultBodyLimit::max(MAX_ARTIFACT_BYTES)),
        )
        .route("/api/v1/artifacts/{digest}", get(download_artifact))
        .route("/api/v1/models", get(list_models))
        .route(
            "/api/v1/models/{name}/versions",
            get(list_versions).post(register_version),
        )
        .route(
            "/api/v1/models/{name}/versions/{version}",
            get(get_version).patch(update_version),
        )
        .route(
            "/api/v1/models/{name}/versions/{version}/stage",
            post(transition_stage),
        )
        .route("/api/v1/models/{name}/latest", get(latest_versions))
        .with_state(api)
}

/// Serve the registry on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, api: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "registry listening");
    }
    axum::serve(listener, registry_router(api))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(api): State<ApiState>) -> Result<Json<HealthResponse>> {
    api.health().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    }))
}

async fn create_run(
    State(api): State<ApiState>,
    body: std::result::Result<Json<NewRun>, JsonRejection>,
) -> Result<(StatusCode, Json<RunRecord>)> {
    let run = api.create_run(json_body(body)?).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(
    State(api): State<ApiState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunRecord>>> {
    Ok(Json(api.list_runs(query.experiment.as_deref()).await?))
}

async fn get_run(
    State(api): State<ApiState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>> {
    Ok(Json(api.get_run(&RunId(run_id)).await?))
}

async fn log_metric(
    State(api): State<ApiState>,
    Path(run_id): Path<String>,
    body: std::result::Result<Json<LogMetricRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let req = json_body(body)?;
    api.log_metric(&RunId(run_id), &req.name, req.value).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn log_artifact(
    State(api): State<ApiState>,
    Path(run_id): Path<String>,
    body: std::result::Result<Json<LogArtifactRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let req = json_body(body)?;
    api.log_artifact(&RunId(run_id), &req.artifact).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn finish_run(
    State(api): State<ApiState>,
    Path(run_id): Path<String>,
    body: std::result::Result<Json<FinishRunRequest>, JsonRejection>,
) -> Result<Json<RunRecord>> {
    let req = json_body(body)?;
    Ok(Json(api.finish_run(&RunId(run_id), req.status).await?))
}

async fn upload_artifact(
    State(api): State<ApiState>,
    bytes: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>)> {
    let size = bytes.len() as u64;
    let artifact = api.upload_artifact(bytes.to_vec()).await?;
    let digest = artifact
        .digest()
        .ok_or_else(|| PipelineError::Internal(format!("store returned non-cas ref {artifact}")))?;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            artifact,
            digest,
            size,
        }),
    ))
}

async fn download_artifact(
    State(api): State<ApiState>,
    Path(digest): Path<String>,
) -> Result<Response> {
    let digest = ContentDigest::try_from(digest)
        .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
    let bytes = api.download_artifact(&ArtifactRef::cas(&digest)).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

async fn list_models(State(api): State<ApiState>) -> Result<Json<Vec<RegisteredModel>>> {
    Ok(Json(api.list_models().await?))
}

async fn list_versions(
    State(api): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<ModelVersion>>> {
    Ok(Json(api.list_versions(&name).await?))
}

async fn register_version(
    State(api): State<ApiState>,
    Path(name): Path<String>,
    body: std::result::Result<Json<RegisterVersionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ModelVersion>)> {
    let req = json_body(body)?;
    let request = PromotionRequest {
        name,
        run_id: req.run_id,
        artifact: req.artifact,
        target_stage: req.stage,
        policy: req.demotion,
    };
    let version = api.register_and_promote(&request).await?;
    info!(
        model = %version.name,
        version = version.version,
        stage = %version.stage,
        "registered model version"
    );
    Ok((StatusCode::CREATED, Json(version)))
}

async fn get_version(
    State(api): State<ApiState>,
    Path((name, version)): Path<(String, u64)>,
) -> Result<Json<ModelVersion>> {
    Ok(Json(api.get_version(&name, version).await?))
}

async fn update_version(
    State(api): State<ApiState>,
    Path((name, version)): Path<(String, u64)>,
    body: std::result::Result<Json<UpdateVersionRequest>, JsonRejection>,
) -> Result<Json<ModelVersion>> {
    let req = json_body(body)?;
    Ok(Json(
        api.update_version_description(&name, version, req.description)
            .await?,
    ))
}

async fn transition_stage(
    State(api): State<ApiState>,
    Path((name, version)): Path<(String, u64)>,
    body: std::result::Result<Json<TransitionStageRequest>, JsonRejection>,
) -> Result<Json<ModelVersion>> {
    let req = json_body(body)?;
    let moved = api
        .transition_stage(&name, version, req.stage, req.demotion)
        .await?;
    info!(model = %name, version, stage = %moved.stage, "stage transitioned");
    Ok(Json(moved))
}

async fn latest_versions(
    State(api): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<LatestQuery>,
) -> Result<Json<Vec<ModelVersion>>> {
    let stages = parse_stage_list(query.stages.as_deref())?;
    Ok(Json(
        api.get_latest_versions(&name, stages.as_deref()).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        assert_eq!(
            PipelineError::RunNotFinished("r".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            PipelineError::StageEmpty {
                name: "m".into(),
                stage: "Staging".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PipelineError::InvalidInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PipelineError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

//! Inference HTTP surface.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use mlgate_state::{ArtifactRef, RunId, Stage};
use serde::{Deserialize, Serialize};

use crate::domain::error::PipelineError;
use crate::domain::inference::{InferenceRequest, InferenceResponse};
use crate::metrics::METRICS;
use crate::registry::wire::ErrorBody;
use crate::serving::state::{HealthReport, LoadedModel, ServingState};

type AppState = Arc<ServingState>;

/// `GET /model` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: u64,
    /// Stage of the version when it was resolved.
    pub stage: Stage,
    pub run_id: RunId,
    pub artifact: ArtifactRef,
    pub selector: String,
    pub columns: Vec<String>,
    pub loaded_at: DateTime<Utc>,
}

impl From<&LoadedModel> for ModelInfo {
    fn from(model: &LoadedModel) -> Self {
        Self {
            name: model.version.name.clone(),
            version: model.version.version,
            stage: model.version.stage,
            run_id: model.version.run_id.clone(),
            artifact: model.version.artifact.clone(),
            selector: model.selector.to_string(),
            columns: model.classifier.columns().to_vec(),
            loaded_at: model.loaded_at,
        }
    }
}

pub fn serving_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/model", get(model_info))
        .route("/invocations", post(invocations))
        .with_state(state)
}

fn not_ready(state: &ServingState) -> Response {
    let body = ErrorBody {
        error_code: "MODEL_NOT_READY".to_string(),
        message: format!(
            "model '{}' is {}",
            state.model_name(),
            state.phase().name()
        ),
    };
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health())
}

async fn ready(State(state): State<AppState>) -> Response {
    if state.model().is_some() {
        (StatusCode::OK, Json(state.health())).into_response()
    } else {
        not_ready(&state)
    }
}

async fn model_info(State(state): State<AppState>) -> Response {
    match state.model() {
        Some(model) => Json(ModelInfo::from(model.as_ref())).into_response(),
        None => not_ready(&state),
    }
}

async fn invocations(
    State(state): State<AppState>,
    body: Result<Json<InferenceRequest>, JsonRejection>,
) -> Response {
    let Some(model) = state.model() else {
        return not_ready(&state);
    };
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return PipelineError::InvalidInput(rejection.body_text()).into_response();
        }
    };
    if let Err(e) = check_request(&model, &request) {
        return e.into_response();
    }

    let predictions = model.classifier.predict(&request.data);
    METRICS.add_predictions(predictions.len() as u64);
    Json(InferenceResponse { predictions }).into_response()
}

fn check_request(model: &LoadedModel, request: &InferenceRequest) -> Result<(), PipelineError> {
    request.validate(model.classifier.feature_count())?;
    if request.columns != model.classifier.columns() {
        return Err(PipelineError::InvalidInput(format!(
            "columns {:?} do not match the model's {:?}",
            request.columns,
            model.classifier.columns()
        )));
    }
    Ok(())
}

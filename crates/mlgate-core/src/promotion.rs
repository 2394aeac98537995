//! Register-and-promote, as performed by the training job.

use mlgate_state::{ArtifactRef, DemotionPolicy, ModelVersion, RunId, Stage};
use serde::{Deserialize, Serialize};

use crate::domain::error::{PipelineError, Result};
use crate::obs;
use crate::registry::RegistryApi;

/// Longest accepted registered-model name.
pub const MAX_MODEL_NAME_LEN: usize = 128;

/// Everything the registry needs to bind a finished run's artifact to a
/// registered name and stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRequest {
    pub name: String,
    pub run_id: RunId,
    pub artifact: ArtifactRef,
    pub target_stage: Stage,
    #[serde(default)]
    pub policy: DemotionPolicy,
}

/// Registered-model names: ASCII letters, digits, `-`, `_` and `.`.
pub fn validate_model_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_MODEL_NAME_LEN {
        return Err(PipelineError::InvalidInput(format!(
            "model name must be 1..={MAX_MODEL_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(PipelineError::InvalidInput(format!(
            "model name '{name}' may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}

/// Create the next version of `request.name` from a finished run and move
/// it to `request.target_stage`, demoting the previous holder.
///
/// The registry performs both steps atomically; a failure leaves no new
/// version behind. `RunNotFinished` if the run is still running or failed.
pub async fn register_and_promote(
    api: &dyn RegistryApi,
    request: &PromotionRequest,
) -> Result<ModelVersion> {
    validate_model_name(&request.name)?;
    let version = api.register_and_promote(request).await?;
    obs::emit_version_registered(
        &version.name,
        version.version,
        version.stage.as_str(),
        &version.run_id.0,
    );
    Ok(version)
}

/// Move an existing version between stages (operator action).
pub async fn transition_stage(
    api: &dyn RegistryApi,
    name: &str,
    version: u64,
    stage: Stage,
    policy: DemotionPolicy,
) -> Result<ModelVersion> {
    let moved = api.transition_stage(name, version, stage, policy).await?;
    obs::emit_stage_transitioned(name, moved.version, moved.stage.as_str());
    Ok(moved)
}

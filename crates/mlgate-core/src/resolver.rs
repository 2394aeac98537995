//! Artifact resolver: "which version should this serving process load?"
//!
//! Resolution by stage is deliberately late-bound. A serving process started
//! before training has registered anything sees `ModelNotRegisteredYet` (or
//! `StageEmpty`), both retryable, and keeps polling through
//! [`resolve_with_retry`] until the version exists or the policy runs out.

use mlgate_state::{ModelVersion, Stage};

use crate::domain::error::{PipelineError, Result};
use crate::domain::selector::VersionSelector;
use crate::obs;
use crate::registry::RegistryApi;
use crate::retry::{Attempted, RetryExecutor, RetryPolicy};

/// Resolve `selector` against the current registry state, once.
pub async fn resolve(
    api: &dyn RegistryApi,
    name: &str,
    selector: VersionSelector,
) -> Result<ModelVersion> {
    match selector {
        VersionSelector::Version(version) => match api.get_version(name, version).await {
            Ok(found) => Ok(found),
            Err(PipelineError::NotFound(message)) => {
                if api.list_versions(name).await?.is_empty() {
                    Err(PipelineError::ModelNotRegisteredYet {
                        name: name.to_string(),
                    })
                } else {
                    Err(PipelineError::NotFound(message))
                }
            }
            Err(other) => Err(other),
        },
        VersionSelector::Stage(stage) => {
            let versions = api.list_versions(name).await?;
            select_by_stage(name, &versions, stage).cloned()
        }
    }
}

/// Pick the version serving `stage` from a version listing.
pub fn select_by_stage<'a>(
    name: &str,
    versions: &'a [ModelVersion],
    stage: Stage,
) -> Result<&'a ModelVersion> {
    if versions.is_empty() {
        return Err(PipelineError::ModelNotRegisteredYet {
            name: name.to_string(),
        });
    }
    ModelVersion::latest_in_stage(versions, stage).ok_or_else(|| PipelineError::StageEmpty {
        name: name.to_string(),
        stage: stage.to_string(),
    })
}

/// Resolve with bounded retries on not-yet-available and connectivity errors.
///
/// `on_attempt(attempt)` fires before every attempt so callers can publish
/// progress (the serving `/health` phase). Exhaustion becomes `TimedOut`;
/// any other error aborts immediately.
pub async fn resolve_with_retry<F>(
    api: &dyn RegistryApi,
    name: &str,
    selector: VersionSelector,
    policy: &RetryPolicy,
    mut on_attempt: F,
) -> Result<Attempted<ModelVersion>>
where
    F: FnMut(u32),
{
    let selector_label = selector.to_string();
    let resolved = RetryExecutor::execute(
        policy,
        |attempt| {
            on_attempt(attempt);
            resolve(api, name, selector)
        },
        |error, attempt| obs::emit_resolve_retry(name, &selector_label, attempt, error),
    )
    .await
    .map_err(|e| e.into_pipeline_error(&format!("resolving {name} ({selector_label})")))?;

    obs::emit_resolved(
        name,
        &selector_label,
        resolved.value.version,
        resolved.attempts,
    );
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use mlgate_state::{ArtifactRef, ContentDigest, RunId};

    use super::*;

    fn version(n: u64, stage: Stage, promoted_at: i64) -> ModelVersion {
        let ts = DateTime::<Utc>::from_timestamp(promoted_at, 0).unwrap();
        ModelVersion {
            name: "clf-model".into(),
            version: n,
            run_id: RunId(format!("run-{n}")),
            stage,
            artifact: ArtifactRef::cas(&ContentDigest::from_bytes(&n.to_le_bytes())),
            description: None,
            created_at: ts,
            stage_updated_at: ts,
        }
    }

    #[test]
    fn no_versions_is_not_registered_yet() {
        let err = select_by_stage("clf-model", &[], Stage::Staging).unwrap_err();
        assert!(matches!(err, PipelineError::ModelNotRegisteredYet { .. }));
        assert!(err.retryable());
    }

    #[test]
    fn unoccupied_stage_is_empty() {
        let versions = vec![version(1, Stage::None, 10)];
        let err = select_by_stage("clf-model", &versions, Stage::Production).unwrap_err();
        assert!(matches!(err, PipelineError::StageEmpty { .. }));
        assert!(err.is_not_yet_available());
    }

    #[test]
    fn concurrent_holders_pick_most_recently_promoted() {
        let versions = vec![
            version(1, Stage::Staging, 10),
            version(2, Stage::Staging, 30),
            version(3, Stage::Staging, 20),
        ];
        let picked = select_by_stage("clf-model", &versions, Stage::Staging).unwrap();
        assert_eq!(picked.version, 2);
    }

    #[test]
    fn unslotted_stage_picks_highest_version() {
        let versions = vec![
            version(1, Stage::Archived, 50),
            version(2, Stage::Archived, 10),
        ];
        let picked = select_by_stage("clf-model", &versions, Stage::Archived).unwrap();
        assert_eq!(picked.version, 2);
    }
}

//! JSON request/response bodies of the registry HTTP API.

use mlgate_state::{ArtifactRef, ContentDigest, DemotionPolicy, RunId, RunStatus, Stage};
use serde::{Deserialize, Serialize};

use crate::domain::error::PipelineError;

/// Error body returned with every non-2xx registry response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_code: String,
    pub message: String,
}

impl From<&PipelineError> for ErrorBody {
    fn from(err: &PipelineError) -> Self {
        Self {
            error_code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMetricRequest {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogArtifactRequest {
    pub artifact: ArtifactRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRunRequest {
    pub status: RunStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRunsQuery {
    pub experiment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub artifact: ArtifactRef,
    pub digest: ContentDigest,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterVersionRequest {
    pub run_id: RunId,
    pub artifact: ArtifactRef,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub demotion: DemotionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionStageRequest {
    pub stage: Stage,
    #[serde(default)]
    pub demotion: DemotionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateVersionRequest {
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatestQuery {
    /// Comma-separated stage names; all stages when absent.
    pub stages: Option<String>,
}

/// Parse the `stages` query parameter.
pub fn parse_stage_list(raw: Option<&str>) -> Result<Option<Vec<Stage>>, PipelineError> {
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    raw.split(',')
        .map(|s| {
            s.parse::<Stage>()
                .map_err(|e| PipelineError::InvalidInput(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Rebuild a pipeline error from a non-2xx registry response.
pub fn error_from_status(status: u16, body: Option<ErrorBody>) -> PipelineError {
    let (code, message) = match body {
        Some(b) => (b.error_code, b.message),
        None => (String::new(), format!("registry returned HTTP {status}")),
    };
    match status {
        400 | 422 => PipelineError::InvalidInput(message),
        401 | 403 => PipelineError::Fatal(message),
        404 => PipelineError::NotFound(message),
        409 if code == "RUN_NOT_FINISHED" => PipelineError::RunNotFinished(message),
        409 => PipelineError::Conflict(message),
        500..=599 => {
            PipelineError::TransientConnectivity(format!("registry returned HTTP {status}: {message}"))
        }
        _ => PipelineError::Internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_list_parses_comma_separated() {
        let stages = parse_stage_list(Some("Staging,production")).unwrap().unwrap();
        assert_eq!(stages, vec![Stage::Staging, Stage::Production]);
        assert!(parse_stage_list(None).unwrap().is_none());
        assert!(parse_stage_list(Some("")).unwrap().is_none());
        assert!(parse_stage_list(Some("Staging,Canary")).is_err());
    }

    #[test]
    fn status_codes_map_back_to_taxonomy() {
        let body = |code: &str| {
            Some(ErrorBody {
                error_code: code.to_string(),
                message: "m".to_string(),
            })
        };
        assert!(matches!(
            error_from_status(409, body("RUN_NOT_FINISHED")),
            PipelineError::RunNotFinished(_)
        ));
        assert!(matches!(
            error_from_status(409, body("CONFLICT")),
            PipelineError::Conflict(_)
        ));
        assert!(matches!(
            error_from_status(404, body("NOT_FOUND")),
            PipelineError::NotFound(_)
        ));
        assert!(error_from_status(503, None).retryable());
        assert!(matches!(
            error_from_status(401, None),
            PipelineError::Fatal(_)
        ));
    }

    #[test]
    fn register_request_defaults() {
        let req: RegisterVersionRequest = serde_json::from_str(&format!(
            r#"{{"run_id": "abc", "artifact": "cas://{}"}}"#,
            ContentDigest::from_bytes(b"m")
        ))
        .unwrap();
        assert_eq!(req.stage, Stage::None);
        assert_eq!(req.demotion, DemotionPolicy::ToNone);
    }
}

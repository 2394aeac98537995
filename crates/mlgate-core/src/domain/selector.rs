use std::fmt;
use std::str::FromStr;

use mlgate_state::Stage;
use serde::{Deserialize, Serialize};

use crate::domain::error::PipelineError;

/// Which version of a registered model a serving process wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSelector {
    /// An explicit version number.
    Version(u64),
    /// Whatever version currently holds the stage.
    Stage(Stage),
}

impl VersionSelector {
    /// Build a selector from the serving process knobs. An explicit version
    /// wins over a stage; neither is a configuration error.
    pub fn from_parts(version: Option<u64>, stage: Option<&str>) -> Result<Self, PipelineError> {
        match (version, stage) {
            (Some(0), _) => Err(PipelineError::Fatal(
                "model versions start at 1".to_string(),
            )),
            (Some(v), _) => Ok(Self::Version(v)),
            (None, Some(s)) => s.parse(),
            (None, None) => Err(PipelineError::Fatal(
                "either a model version or a stage must be configured".to_string(),
            )),
        }
    }
}

impl FromStr for VersionSelector {
    type Err = PipelineError;

    /// Accepts a version number (`"3"`) or a stage name (`"Staging"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(v) = s.trim().parse::<u64>() {
            return Self::from_parts(Some(v), None);
        }
        s.parse::<Stage>()
            .map(Self::Stage)
            .map_err(|e| PipelineError::Fatal(e.to_string()))
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(v) => write!(f, "version {v}"),
            Self::Stage(s) => write!(f, "stage {s}"),
        }
    }
}

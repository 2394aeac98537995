//! Serving lifecycle state, shared between the startup task and handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mlgate_state::ModelVersion;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::domain::selector::VersionSelector;
use crate::training::classifier::LogisticClassifier;

/// A model held in memory, with the registry entry it came from.
#[derive(Debug)]
pub struct LoadedModel {
    pub version: ModelVersion,
    pub selector: VersionSelector,
    pub classifier: LogisticClassifier,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Phase {
    Starting,
    /// Still waiting for the registry to hold a matching version.
    Resolving {
        attempts: u32,
    },
    Loading {
        version: u64,
    },
    Ready(Arc<LoadedModel>),
    Failed(String),
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Resolving { .. } => "resolving",
            Phase::Loading { .. } => "loading",
            Phase::Ready(_) => "ready",
            Phase::Failed(_) => "failed",
        }
    }
}

/// `GET /health` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub phase: String,
    pub model: String,
    pub selector: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Phase cell plus the identity of what is being served.
#[derive(Debug)]
pub struct ServingState {
    model_name: String,
    selector: VersionSelector,
    phase: watch::Sender<Phase>,
}

impl ServingState {
    pub fn new(model_name: impl Into<String>, selector: VersionSelector) -> Arc<Self> {
        let (phase, _) = watch::channel(Phase::Starting);
        Arc::new(Self {
            model_name: model_name.into(),
            selector,
            phase,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn selector(&self) -> VersionSelector {
        self.selector
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    pub fn phase(&self) -> Phase {
        self.phase.borrow().clone()
    }

    /// The loaded model, once the phase is `Ready`.
    pub fn model(&self) -> Option<Arc<LoadedModel>> {
        match &*self.phase.borrow() {
            Phase::Ready(model) => Some(model.clone()),
            _ => None,
        }
    }

    pub fn health(&self) -> HealthReport {
        let phase = self.phase();
        let (attempts, version, error) = match &phase {
            Phase::Resolving { attempts } => (Some(*attempts), None, None),
            Phase::Loading { version } => (None, Some(*version), None),
            Phase::Ready(model) => (None, Some(model.version.version), None),
            Phase::Failed(err) => (None, None, Some(err.clone())),
            Phase::Starting => (None, None, None),
        };
        HealthReport {
            status: "ok".to_string(),
            phase: phase.name().to_string(),
            model: self.model_name.clone(),
            selector: self.selector.to_string(),
            attempts,
            version,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use mlgate_state::Stage;

    use super::*;

    #[test]
    fn health_reports_resolving_attempts() {
        let state = ServingState::new("clf-model", VersionSelector::Stage(Stage::Staging));
        assert_eq!(state.health().phase, "starting");

        state.set_phase(Phase::Resolving { attempts: 4 });
        let report = state.health();
        assert_eq!(report.phase, "resolving");
        assert_eq!(report.attempts, Some(4));
        assert_eq!(report.selector, "stage Staging");
        assert!(state.model().is_none());
    }
}

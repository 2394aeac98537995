//! mlgate core library
//!
//! Readiness gating, stage-based artifact resolution, promotion and
//! process orchestration for a registry → training → serving pipeline.

pub mod domain;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod promotion;
pub mod readiness;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod serving;
pub mod telemetry;
pub mod training;

pub use domain::{
    exit_codes, InferenceRequest, InferenceResponse, PipelineError, Result, VersionSelector,
};

pub use mlgate_state::{
    ArtifactRef, ContentDigest, DemotionPolicy, ModelVersion, NewRun, RegisteredModel, RunId,
    RunRecord, RunStatus, Stage,
};

pub use metrics::METRICS;
pub use orchestrator::{Orchestrator, PipelineGraph, PipelineSpec};
pub use promotion::{register_and_promote, transition_stage, PromotionRequest};
pub use readiness::{wait_until_healthy, HealthProbe, HttpHealthProbe, Readiness};
pub use registry::{
    open_registry, registry_router, HttpRegistryClient, LeaseSweeper, RegistryApi,
    RegistryService,
};
pub use resolver::{resolve, resolve_with_retry};
pub use retry::{RetryExecutor, RetryPolicy};
pub use serving::{run_serving, ServingConfig};
pub use telemetry::{init_tracing, level_for_verbosity};
pub use training::{run_training, TrainingConfig, TrainingOutcome};

/// Crate version, reported by `/health` endpoints.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! mlgate-state: persistence layer for the mlgate registry service
//!
//! This crate owns every byte the registry persists: run metadata, the
//! registered-model / model-version / stage table, and artifact blobs.
//!
//! ## Key Components
//!
//! - `RunLedger`: run lifecycle (create, log metric/artifact, finish, lease expiry)
//! - `ModelRegistry`: versioned models and single-slot stage transitions
//! - `CasStore`: content-addressed artifact blobs
//! - `SurrealHandle`: connection to an in-memory or durable (`surrealkv://`) store
//!
//! In-memory fakes for all traits live in [`fakes`].

mod error;
pub mod cas;
pub mod fakes;
mod handle;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_ledger;
pub mod surreal_model_registry;

pub use cas::FsCasStore;
pub use error::{StateError, StorageError};
pub use handle::SurrealHandle;
pub use storage_traits::{
    apply_stage_transition, ArtifactRef, CasStore, ContentDigest, DemotionPolicy, ModelRegistry,
    ModelVersion, NewRun, RegisteredModel, RunId, RunLedger, RunRecord, RunStatus, Stage,
    StorageResult, FAILURE_REASON_TAG,
};
pub use surreal_ledger::SurrealRunLedger;
pub use surreal_model_registry::SurrealModelRegistry;

/// Result type for mlgate-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;

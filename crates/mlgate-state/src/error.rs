//! Error types for mlgate-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing store
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Unsupported or malformed store URI
    #[error("Invalid store URI: {0}")]
    InvalidUri(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage traits
#[derive(Error, Debug)]
pub enum StorageError {
    /// No blob stored under the digest
    #[error("content not found: {digest}")]
    NotFound { digest: String },

    /// Digest is not 64 lowercase hex chars
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Artifact reference is empty or not a known scheme
    #[error("invalid artifact reference: {reference}")]
    InvalidArtifactRef { reference: String },

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Run is not in the status the operation requires
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    #[error("registered model not found: {name}")]
    ModelNotFound { name: String },

    #[error("model version not found: {name} version {version}")]
    VersionNotFound { name: String, version: u64 },

    #[error("invalid stage: {value}")]
    InvalidStage { value: String },

    /// Stage table left in a state the single-slot rule forbids
    #[error("stage conflict on {name}: {detail}")]
    StageConflict { name: String, detail: String },

    /// Backend (database) failure
    #[error("backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

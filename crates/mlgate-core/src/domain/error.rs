//! Pipeline error taxonomy.
//!
//! Every failure a pipeline process can see maps to one variant here. The
//! variant decides two things: whether a bounded retry loop should try
//! again ([`PipelineError::retryable`]) and which process exit code a
//! binary reports when the error is final ([`PipelineError::exit_code`]).

use std::time::Duration;

use mlgate_state::{StateError, StorageError};

/// sysexits(3) codes used by the binaries.
pub mod exit_codes {
    pub const FAILURE: i32 = 1;
    pub const UNAVAILABLE: i32 = 69;
    pub const TEMPFAIL: i32 = 75;
    pub const CONFIG: i32 = 78;
    /// Stopped by Ctrl-C (128 + SIGINT).
    pub const INTERRUPTED: i32 = 130;
}

/// mlgate pipeline errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Registry unreachable, connection reset, 5xx, per-attempt timeout.
    #[error("registry unavailable: {0}")]
    TransientConnectivity(String),

    /// The registered model has zero versions.
    #[error("model '{name}' has no registered versions yet")]
    ModelNotRegisteredYet { name: String },

    /// The model exists but nothing occupies the requested stage.
    #[error("no version of '{name}' is in stage {stage}")]
    StageEmpty { name: String, stage: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Promotion attempted for a run that has not finished successfully.
    #[error("run not finished: {0}")]
    RunNotFinished(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Misconfiguration or authentication failure.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A bounded retry loop ran out of attempts or time.
    #[error("{what} timed out after {attempts} attempts ({elapsed:?}): {last_error}")]
    TimedOut {
        what: String,
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },

    /// Registry-internal failure (storage backend, IO).
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether a bounded retry loop should try again after this error.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientConnectivity(_)
                | Self::ModelNotRegisteredYet { .. }
                | Self::StageEmpty { .. }
        )
    }

    /// Not-yet-available errors are retryable but are not connectivity issues.
    pub fn is_not_yet_available(&self) -> bool {
        matches!(
            self,
            Self::ModelNotRegisteredYet { .. } | Self::StageEmpty { .. }
        )
    }

    /// Process exit code for a final, unrecovered error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fatal(_) => exit_codes::CONFIG,
            Self::TimedOut { .. } => exit_codes::TEMPFAIL,
            Self::TransientConnectivity(_) => exit_codes::UNAVAILABLE,
            _ => exit_codes::FAILURE,
        }
    }

    /// Stable machine-readable code used in registry error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransientConnectivity(_) => "TRANSIENT_CONNECTIVITY",
            Self::ModelNotRegisteredYet { .. } => "MODEL_NOT_REGISTERED_YET",
            Self::StageEmpty { .. } => "STAGE_EMPTY",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::RunNotFinished(_) => "RUN_NOT_FINISHED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Fatal(_) => "FATAL",
            Self::TimedOut { .. } => "TIMED_OUT",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. }
            | StorageError::RunNotFound { .. }
            | StorageError::ModelNotFound { .. }
            | StorageError::VersionNotFound { .. } => Self::NotFound(err.to_string()),
            StorageError::InvalidRunState { .. } | StorageError::StageConflict { .. } => {
                Self::Conflict(err.to_string())
            }
            StorageError::InvalidDigest { .. }
            | StorageError::InvalidArtifactRef { .. }
            | StorageError::InvalidStage { .. } => Self::InvalidInput(err.to_string()),
            StorageError::Backend(_) | StorageError::Io(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<StateError> for PipelineError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::InvalidUri(_) => Self::Fatal(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Internal(format!("malformed registry response: {err}"))
        } else if err.is_builder() {
            Self::Fatal(format!("invalid registry request: {err}"))
        } else {
            Self::TransientConnectivity(err.to_string())
        }
    }
}

/// Result type for mlgate pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

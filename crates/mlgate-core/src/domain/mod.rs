//! Domain types shared by the pipeline processes.

pub mod error;
pub mod inference;
pub mod selector;

pub use error::{exit_codes, PipelineError, Result};
pub use inference::{InferenceRequest, InferenceResponse};
pub use selector::VersionSelector;

//! Training job and the small classifier it fits.

pub mod classifier;
pub mod dataset;
pub mod job;

pub use classifier::{FitOptions, LogisticClassifier};
pub use dataset::Dataset;
pub use job::{run_training, TrainingConfig, TrainingOutcome};

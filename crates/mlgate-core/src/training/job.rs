//! One-shot training job.
//!
//! Create a run, fit, log metrics and the model artifact, finish the run,
//! then register and promote the artifact. Any failure before the run is
//! finished marks it `FAILED`; promotion only ever sees a finished run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use mlgate_state::{ArtifactRef, DemotionPolicy, ModelVersion, NewRun, RunId, RunStatus, Stage};
use tokio::time::Instant;
use tracing::{info, warn, Instrument};

use crate::domain::error::{PipelineError, Result};
use crate::obs;
use crate::promotion::{self, validate_model_name, PromotionRequest};
use crate::registry::RegistryApi;
use crate::training::classifier::{FitOptions, LogisticClassifier};
use crate::training::dataset::Dataset;

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub experiment: String,
    /// Defaults to the start time in unix seconds.
    pub run_name: Option<String>,
    pub model_name: String,
    pub target_stage: Stage,
    pub demotion: DemotionPolicy,
    /// Version description; a generated one when `None`.
    pub description: Option<String>,
    /// Where the held-out rows are written, in the inference request layout.
    pub test_data: PathBuf,
    pub samples: usize,
    pub features: usize,
    pub seed: u64,
    /// Fraction of rows held out of training entirely.
    pub holdout_fraction: f64,
    pub tags: BTreeMap<String, String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            experiment: "default".to_string(),
            run_name: None,
            model_name: "clf-model".to_string(),
            target_stage: Stage::Staging,
            demotion: DemotionPolicy::ToNone,
            description: None,
            test_data: PathBuf::from("test.json"),
            samples: 569,
            features: 8,
            seed: 123,
            holdout_fraction: 0.2,
            tags: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub run_id: RunId,
    pub version: ModelVersion,
    pub accuracy_train: f64,
    pub accuracy_test: f64,
}

struct Fitted {
    artifact: ArtifactRef,
    accuracy_train: f64,
    accuracy_test: f64,
}

pub async fn run_training(api: &dyn RegistryApi, config: &TrainingConfig) -> Result<TrainingOutcome> {
    validate_model_name(&config.model_name)?;

    let data = Dataset::synthetic(config.samples, config.features, config.seed)?;
    let (pool, holdout) = data.stratified_split(config.holdout_fraction, config.seed)?;
    write_test_data(&config.test_data, &holdout).await?;
    info!(
        path = %config.test_data.display(),
        rows = holdout.len(),
        "wrote held-out test data"
    );

    let run = api
        .create_run(NewRun {
            experiment: config.experiment.clone(),
            run_name: Some(
                config
                    .run_name
                    .clone()
                    .unwrap_or_else(|| Utc::now().timestamp().to_string()),
            ),
            tags: config.tags.clone(),
        })
        .await?;
    let run_id = run.run_id.clone();
    let span = obs::run_span(&run_id.0);
    obs::emit_run_started(&run_id.0, &run.experiment);
    let started = Instant::now();

    let fitted = match fit_and_log(api, config, &run_id, &pool)
        .instrument(span.clone())
        .await
    {
        Ok(fitted) => fitted,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "training failed");
            if let Err(finish_err) = api.finish_run(&run_id, RunStatus::Failed).await {
                obs::emit_run_finalize_error(&run_id.0, &finish_err);
            }
            obs::emit_run_finished(&run_id.0, RunStatus::Failed.as_str(), elapsed_ms(started));
            return Err(e);
        }
    };

    api.finish_run(&run_id, RunStatus::Finished).await?;
    obs::emit_run_finished(&run_id.0, RunStatus::Finished.as_str(), elapsed_ms(started));

    let request = PromotionRequest {
        name: config.model_name.clone(),
        run_id: run_id.clone(),
        artifact: fitted.artifact,
        target_stage: config.target_stage,
        policy: config.demotion,
    };
    let version = promotion::register_and_promote(api, &request)
        .instrument(span.clone())
        .await?;

    let description = config.description.clone().unwrap_or_else(|| {
        format!(
            "Logistic regression over {} standardized features.",
            config.features
        )
    });
    let version = match api
        .update_version_description(&version.name, version.version, Some(description))
        .await
    {
        Ok(described) => described,
        Err(e) => {
            // The version is registered and promoted; a missing description is cosmetic.
            warn!(model = %version.name, version = version.version, error = %e, "could not set description");
            version
        }
    };

    Ok(TrainingOutcome {
        run_id,
        version,
        accuracy_train: fitted.accuracy_train,
        accuracy_test: fitted.accuracy_test,
    })
}

async fn fit_and_log(
    api: &dyn RegistryApi,
    config: &TrainingConfig,
    run_id: &RunId,
    pool: &Dataset,
) -> Result<Fitted> {
    let (train, test) = pool.stratified_split(0.2, config.seed)?;
    let model = LogisticClassifier::fit(&train, FitOptions::default())?;
    let accuracy_train = model.score(&train);
    let accuracy_test = model.score(&test);
    info!(accuracy_train, accuracy_test, rows = train.len(), "model fitted");

    api.log_metric(run_id, "accuracy_train", accuracy_train).await?;
    api.log_metric(run_id, "accuracy_test", accuracy_test).await?;

    let artifact = api.upload_artifact(model.to_bytes()?).await?;
    api.log_artifact(run_id, &artifact).await?;
    Ok(Fitted {
        artifact,
        accuracy_train,
        accuracy_test,
    })
}

async fn write_test_data(path: &Path, holdout: &Dataset) -> Result<()> {
    let body = serde_json::to_vec_pretty(&holdout.to_inference_request())
        .map_err(|e| PipelineError::Internal(format!("serializing test data: {e}")))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            PipelineError::Fatal(format!("cannot create {}: {e}", parent.display()))
        })?;
    }
    tokio::fs::write(path, body)
        .await
        .map_err(|e| PipelineError::Fatal(format!("cannot write {}: {e}", path.display())))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

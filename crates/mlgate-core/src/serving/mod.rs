//! Serving process.
//!
//! The HTTP listener comes up first so `/health` can report the startup
//! phase. The model is then resolved from the registry (retrying while it is
//! not yet available), downloaded and loaded. Once loaded it is never
//! swapped: a newer promotion is picked up by the next serving process.

pub mod routes;
pub mod state;

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::error::{PipelineError, Result};
use crate::domain::selector::VersionSelector;
use crate::registry::RegistryApi;
use crate::resolver::resolve_with_retry;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::training::classifier::LogisticClassifier;

pub use routes::{serving_router, ModelInfo};
pub use state::{HealthReport, LoadedModel, Phase, ServingState};

#[derive(Debug, Clone)]
pub struct ServingConfig {
    pub model_name: String,
    pub selector: VersionSelector,
    /// Bounds both resolution and artifact download.
    pub resolve_policy: RetryPolicy,
}

/// Resolve, download and load the configured model, publishing progress
/// into `state`.
pub async fn load_model(
    api: &dyn RegistryApi,
    config: &ServingConfig,
    state: &ServingState,
) -> Result<Arc<LoadedModel>> {
    let resolved = resolve_with_retry(
        api,
        &config.model_name,
        config.selector,
        &config.resolve_policy,
        |attempts| state.set_phase(Phase::Resolving { attempts }),
    )
    .await?;
    let version = resolved.value;
    state.set_phase(Phase::Loading {
        version: version.version,
    });

    let artifact = &version.artifact;
    let bytes = RetryExecutor::execute(
        &config.resolve_policy,
        move |_| api.download_artifact(artifact),
        |error, attempt| warn!(attempt, error = %error, "artifact download failed; retrying"),
    )
    .await
    .map_err(|e| e.into_pipeline_error(&format!("downloading {artifact}")))?
    .value;

    let classifier = LogisticClassifier::from_bytes(&bytes)?;
    info!(
        model = %version.name,
        version = version.version,
        stage = %version.stage,
        features = classifier.feature_count(),
        "model loaded"
    );
    Ok(Arc::new(LoadedModel {
        version,
        selector: config.selector,
        classifier,
        loaded_at: Utc::now(),
    }))
}

/// Serve inference on `listener` until `shutdown` resolves.
///
/// Returns an error, after stopping the listener, when the model cannot be
/// loaded: a non-retryable registry error, a bad artifact, or `TimedOut`.
pub async fn run_serving<F>(
    api: Arc<dyn RegistryApi>,
    config: ServingConfig,
    listener: TcpListener,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let state = ServingState::new(config.model_name.clone(), config.selector);
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, model = %config.model_name, selector = %config.selector, "serving listening");
    }

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let router = serving_router(state.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });
    tokio::pin!(shutdown);
    let loaded = tokio::select! {
        loaded = load_model(api.as_ref(), &config, &state) => loaded,
        _ = &mut shutdown => {
            info!("shutdown requested before the model was loaded");
            return stop_server(stop_tx, server).await;
        }
    };

    match loaded {
        Ok(model) => state.set_phase(Phase::Ready(model)),
        Err(e) => {
            state.set_phase(Phase::Failed(e.to_string()));
            let _ = stop_server(stop_tx, server).await;
            return Err(e);
        }
    }

    shutdown.await;
    info!("shutting down serving");
    stop_server(stop_tx, server).await
}

async fn stop_server(
    stop_tx: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
) -> Result<()> {
    let _ = stop_tx.send(());
    match server.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PipelineError::Internal(format!("serving listener failed: {e}"))),
        Err(e) => Err(PipelineError::Internal(format!("serving task failed: {e}"))),
    }
}

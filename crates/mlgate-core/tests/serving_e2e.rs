//! Serving against a live registry daemon: startup ordering, stage
//! resolution and the no-hot-swap rule.

use std::sync::Arc;
use std::time::Duration;

use mlgate_core::registry::{serve, HttpRegistryClient, RegistryApi, RegistryService};
use mlgate_core::serving::ModelInfo;
use mlgate_core::{
    exit_codes, run_serving, run_training, InferenceRequest, InferenceResponse, PipelineError, RetryPolicy,
    ServingConfig, Stage, TrainingConfig, VersionSelector,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

async fn spawn_registry() -> (Arc<dyn RegistryApi>, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let service: Arc<dyn RegistryApi> = Arc::new(RegistryService::open("mem://").await.unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(serve(listener, service, async move {
        let _ = stopped.await;
    }));
    let client: Arc<dyn RegistryApi> = Arc::new(HttpRegistryClient::new(&url).unwrap());
    (client, stop)
}

struct TestServer {
    url: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<mlgate_core::Result<()>>,
}

async fn spawn_serving(api: Arc<dyn RegistryApi>, selector: VersionSelector, policy: RetryPolicy) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let config = ServingConfig {
        model_name: "clf-model".into(),
        selector,
        resolve_policy: policy,
    };
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(run_serving(api, config, listener, async move {
        let _ = stopped.await;
    }));
    TestServer { url, stop, task }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_interval(Duration::from_millis(50))
        .with_per_attempt_timeout(Duration::from_secs(2))
        .with_deadline(Duration::from_secs(30))
}

fn training_config(dir: &std::path::Path) -> TrainingConfig {
    TrainingConfig {
        test_data: dir.join("test.json"),
        samples: 200,
        features: 4,
        ..TrainingConfig::default()
    }
}

async fn wait_ready(http: &reqwest::Client, url: &str) {
    for _ in 0..200 {
        if let Ok(response) = http.get(format!("{url}/ready")).send().await {
            if response.status() == 200 {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("serving at {url} never became ready");
}

#[tokio::test]
async fn serving_waits_for_training_then_predicts() {
    let dir = tempfile::tempdir().unwrap();
    let (api, _registry) = spawn_registry().await;
    let http = reqwest::Client::new();

    let server = spawn_serving(api.clone(), VersionSelector::Stage(Stage::Staging), fast_policy()).await;

    // Nothing registered yet: listener is up but the model is not.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let ready = http.get(format!("{}/ready", server.url)).send().await.unwrap();
    assert_eq!(ready.status(), 503);
    let health: serde_json::Value = http
        .get(format!("{}/health", server.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["phase"], "resolving");

    let config = training_config(dir.path());
    let outcome = run_training(api.as_ref(), &config).await.unwrap();
    wait_ready(&http, &server.url).await;

    let info: ModelInfo = http
        .get(format!("{}/model", server.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info.version, outcome.version.version);
    assert_eq!(info.stage, Stage::Staging);

    let request: InferenceRequest =
        serde_json::from_slice(&std::fs::read(&config.test_data).unwrap()).unwrap();
    let response: InferenceResponse = http
        .post(format!("{}/invocations", server.url))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response.predictions.len(), request.data.len());
    for p in &response.predictions {
        assert!((0.0..=1.0).contains(p), "{p} is not a probability");
        assert!(((p * 1e4).round() / 1e4 - p).abs() < 1e-12, "{p} is not rounded to 4 places");
    }

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn newer_promotion_does_not_swap_a_running_model() {
    let dir = tempfile::tempdir().unwrap();
    let (api, _registry) = spawn_registry().await;
    let http = reqwest::Client::new();
    let config = training_config(dir.path());

    run_training(api.as_ref(), &config).await.unwrap();
    let first = spawn_serving(api.clone(), VersionSelector::Stage(Stage::Staging), fast_policy()).await;
    wait_ready(&http, &first.url).await;

    let second_outcome = run_training(api.as_ref(), &config).await.unwrap();
    assert_eq!(second_outcome.version.version, 2);

    let running: ModelInfo = http
        .get(format!("{}/model", first.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(running.version, 1);

    let second = spawn_serving(api.clone(), VersionSelector::Stage(Stage::Staging), fast_policy()).await;
    wait_ready(&http, &second.url).await;
    let fresh: ModelInfo = http
        .get(format!("{}/model", second.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fresh.version, 2);

    let pinned = spawn_serving(api.clone(), VersionSelector::Version(1), fast_policy()).await;
    wait_ready(&http, &pinned.url).await;
    let pinned_info: ModelInfo = http
        .get(format!("{}/model", pinned.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pinned_info.version, 1);
    assert_eq!(pinned_info.stage, Stage::None);

    for server in [first, second, pinned] {
        server.stop.send(()).unwrap();
        server.task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn wrong_columns_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (api, _registry) = spawn_registry().await;
    let http = reqwest::Client::new();
    run_training(api.as_ref(), &training_config(dir.path()))
        .await
        .unwrap();

    let server = spawn_serving(api, VersionSelector::Stage(Stage::Staging), fast_policy()).await;
    wait_ready(&http, &server.url).await;

    let response = http
        .post(format!("{}/invocations", server.url))
        .json(&serde_json::json!({
            "columns": ["a", "b", "c", "d"],
            "data": [[0.0, 0.0, 0.0, 0.0]],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = http
        .post(format!("{}/invocations", server.url))
        .json(&serde_json::json!({
            "columns": ["x0"],
            "data": [[0.0]],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn serving_gives_up_when_nothing_is_registered() {
    let (api, _registry) = spawn_registry().await;
    let policy = RetryPolicy::default()
        .with_interval(Duration::from_millis(20))
        .with_max_attempts(3);

    let server = spawn_serving(api, VersionSelector::Stage(Stage::Production), policy).await;
    let err = server.task.await.unwrap().unwrap_err();
    match &err {
        PipelineError::TimedOut { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("expected TimedOut, got {other}"),
    }
    assert_eq!(err.exit_code(), exit_codes::TEMPFAIL);
}

#[tokio::test]
async fn unreachable_registry_times_out_as_retryable() {
    let api: Arc<dyn RegistryApi> = Arc::new(
        HttpRegistryClient::with_timeout("http://127.0.0.1:1", Duration::from_millis(200)).unwrap(),
    );
    let policy = RetryPolicy::default()
        .with_interval(Duration::from_millis(20))
        .with_max_attempts(2);

    let server = spawn_serving(api, VersionSelector::Stage(Stage::Staging), policy).await;
    let err = server.task.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::TimedOut { attempts: 2, .. }), "{err}");
}

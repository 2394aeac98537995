//! mlgate - readiness-gated ML pipeline CLI
//!
//! ## Commands
//!
//! - `train`: one-shot training job; registers and promotes the model
//! - `serve`: resolve a model version from the registry and serve it
//! - `orchestrate`: start the registry, training and serving processes in
//!   dependency order
//! - `models`, `runs`: inspect and operate the registry

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mlgate_core::{
    exit_codes, level_for_verbosity, open_registry, run_serving, run_training, wait_until_healthy,
    DemotionPolicy, HttpHealthProbe, ModelVersion, Orchestrator, PipelineError, PipelineSpec,
    RegistryApi, RetryPolicy, RunId, RunRecord, ServingConfig, Stage, TrainingConfig,
    VersionSelector, METRICS,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mlgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Readiness-gated training, promotion and serving pipeline", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a classifier, log the run and promote the model
    Train(TrainArgs),

    /// Serve a registered model version over HTTP
    Serve(ServeArgs),

    /// Run the whole pipeline from a pipeline definition
    Orchestrate {
        /// Pipeline definition (TOML)
        #[arg(short, long, env = "MLGATE_PIPELINE", default_value = "pipeline.toml")]
        pipeline: PathBuf,
    },

    /// Registered models and their versions
    Models {
        #[command(flatten)]
        registry: RegistryArgs,

        #[command(subcommand)]
        action: ModelAction,
    },

    /// Training runs
    Runs {
        #[command(flatten)]
        registry: RegistryArgs,

        #[command(subcommand)]
        action: RunAction,
    },
}

#[derive(Args, Debug, Clone)]
struct RegistryArgs {
    /// Registry endpoint: http(s)://host:port, mem:// or surrealkv://<dir>
    #[arg(long, env = "MLGATE_REGISTRY_URI", default_value = "http://127.0.0.1:5000")]
    registry_uri: String,
}

/// Readiness gate applied to an HTTP registry before training starts.
#[derive(Args, Debug, Clone)]
struct ProbeArgs {
    /// Seconds between health probes
    #[arg(long, env = "MLGATE_PROBE_INTERVAL", default_value = "2", value_parser = parse_seconds)]
    probe_interval: Duration,

    /// Seconds a single probe may take
    #[arg(long, env = "MLGATE_PROBE_TIMEOUT", default_value = "2", value_parser = parse_seconds)]
    probe_timeout: Duration,

    /// Give up after this many failed probes
    #[arg(long, env = "MLGATE_PROBE_RETRIES")]
    probe_retries: Option<u32>,

    /// Seconds to wait before the first probe
    #[arg(long, env = "MLGATE_PROBE_GRACE", default_value = "0", value_parser = parse_seconds)]
    probe_grace: Duration,

    /// Give up after this many seconds overall
    #[arg(long, env = "MLGATE_PROBE_DEADLINE", default_value = "120", value_parser = parse_seconds)]
    probe_deadline: Duration,
}

impl ProbeArgs {
    fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::default()
            .with_interval(self.probe_interval)
            .with_per_attempt_timeout(self.probe_timeout)
            .with_initial_delay(self.probe_grace)
            .with_deadline(self.probe_deadline);
        match self.probe_retries {
            Some(n) => policy.with_max_attempts(n),
            None => policy,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct TrainArgs {
    #[command(flatten)]
    registry: RegistryArgs,

    #[command(flatten)]
    probe: ProbeArgs,

    /// Experiment the run is logged under
    #[arg(long, env = "MLGATE_EXPERIMENT", default_value = "default")]
    experiment: String,

    /// Run name (default: start time in unix seconds)
    #[arg(long)]
    run_name: Option<String>,

    /// Registered model name
    #[arg(long, env = "MLGATE_MODEL_NAME", default_value = "clf-model")]
    model_name: String,

    /// Stage the new version is promoted to
    #[arg(long, env = "MLGATE_STAGE", default_value = "Staging")]
    stage: Stage,

    /// Move the previous stage holder to Archived instead of None
    #[arg(long)]
    archive_previous: bool,

    /// Version description
    #[arg(long)]
    description: Option<String>,

    /// Where the held-out test rows are written
    #[arg(long, env = "MLGATE_TEST_DATA", default_value = "test.json")]
    test_data: PathBuf,

    /// Synthetic dataset size
    #[arg(long, default_value = "569")]
    samples: usize,

    /// Synthetic feature count
    #[arg(long, default_value = "8")]
    features: usize,

    #[arg(long, default_value = "123")]
    seed: u64,

    /// Run tag as key=value (repeatable)
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,
}

impl TrainArgs {
    fn config(&self) -> TrainingConfig {
        TrainingConfig {
            experiment: self.experiment.clone(),
            run_name: self.run_name.clone(),
            model_name: self.model_name.clone(),
            target_stage: self.stage,
            demotion: demotion_policy(self.archive_previous),
            description: self.description.clone(),
            test_data: self.test_data.clone(),
            samples: self.samples,
            features: self.features,
            seed: self.seed,
            tags: self.tags.iter().cloned().collect::<BTreeMap<_, _>>(),
            ..TrainingConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    #[command(flatten)]
    registry: RegistryArgs,

    /// Registered model name
    #[arg(long, env = "MLGATE_MODEL_NAME", default_value = "clf-model")]
    model_name: String,

    /// Stage to resolve (ignored when --model-version is set)
    #[arg(long, env = "MLGATE_STAGE", default_value = "Staging")]
    stage: String,

    /// Explicit model version
    #[arg(long = "model-version", env = "MLGATE_VERSION")]
    version: Option<u64>,

    /// Listen address
    #[arg(long, env = "MLGATE_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Seconds between resolution attempts
    #[arg(long, env = "MLGATE_RESOLVE_INTERVAL", default_value = "5", value_parser = parse_seconds)]
    resolve_interval: Duration,

    /// Seconds a single registry call may take
    #[arg(long, env = "MLGATE_RESOLVE_TIMEOUT", default_value = "10", value_parser = parse_seconds)]
    resolve_timeout: Duration,

    /// Give up resolving after this many seconds
    #[arg(long, env = "MLGATE_RESOLVE_DEADLINE", default_value = "600", value_parser = parse_seconds)]
    resolve_deadline: Duration,
}

impl ServeArgs {
    fn config(&self) -> Result<ServingConfig, PipelineError> {
        let resolve_policy = RetryPolicy::default()
            .with_interval(self.resolve_interval)
            .with_per_attempt_timeout(self.resolve_timeout)
            .with_deadline(self.resolve_deadline);
        resolve_policy.validate()?;
        Ok(ServingConfig {
            model_name: self.model_name.clone(),
            selector: VersionSelector::from_parts(self.version, Some(&self.stage))?,
            resolve_policy,
        })
    }
}

#[derive(Subcommand, Debug)]
enum ModelAction {
    /// List registered models
    List,

    /// List every version of a model
    Versions { name: String },

    /// Show one version
    Get { name: String, version: u64 },

    /// Latest version per stage
    Latest {
        name: String,

        /// Comma-separated stages (default: all)
        #[arg(long, value_delimiter = ',')]
        stages: Vec<Stage>,
    },

    /// Move a version to a stage, demoting the current holder
    Transition {
        name: String,
        version: u64,
        stage: Stage,

        /// Move the previous holder to Archived instead of None
        #[arg(long)]
        archive_previous: bool,
    },

    /// Set or clear a version description
    Describe {
        name: String,
        version: u64,

        /// New description; omit to clear
        #[arg(long)]
        description: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum RunAction {
    /// List runs, newest first
    List {
        #[arg(long)]
        experiment: Option<String>,
    },

    /// Show one run as JSON
    Get { run_id: String },
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("'{raw}' is not a number of seconds: {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("'{raw}' is not a valid duration: {e}"))
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("tag '{raw}' must look like key=value")),
    }
}

fn demotion_policy(archive_previous: bool) -> DemotionPolicy {
    if archive_previous {
        DemotionPolicy::ToArchived
    } else {
        DemotionPolicy::ToNone
    }
}

/// Exit code for an error that reached `main`.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<PipelineError>()
        .map_or(exit_codes::FAILURE, PipelineError::exit_code)
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    mlgate_core::init_tracing(cli.json, level_for_verbosity(cli.verbose));

    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            let code = exit_code_for(&err);
            error!(exit_code = code, "{err:#}");
            code
        }
    };
    METRICS.flush();
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run(command: Commands) -> Result<i32> {
    match command {
        Commands::Train(args) => cmd_train(&args, ctrl_c()).await,
        Commands::Serve(args) => cmd_serve(&args, ctrl_c()).await,
        Commands::Orchestrate { pipeline } => cmd_orchestrate(&pipeline, ctrl_c()).await,
        Commands::Models { registry, action } => {
            let api = connect(&registry).await?;
            cmd_models(api.as_ref(), action).await?;
            Ok(0)
        }
        Commands::Runs { registry, action } => {
            let api = connect(&registry).await?;
            cmd_runs(api.as_ref(), action).await?;
            Ok(0)
        }
    }
}

async fn connect(args: &RegistryArgs) -> Result<std::sync::Arc<dyn RegistryApi>> {
    open_registry(&args.registry_uri)
        .await
        .with_context(|| format!("Failed to open registry at {}", args.registry_uri))
}

fn is_remote(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

/// Train, register and promote. Interrupting leaves the run `RUNNING` until
/// the registry's lease sweep fails it.
async fn cmd_train<F>(args: &TrainArgs, shutdown: F) -> Result<i32>
where
    F: Future<Output = ()>,
{
    let uri = &args.registry.registry_uri;
    if is_remote(uri) {
        let policy = args.probe.policy();
        policy.validate()?;
        let probe = HttpHealthProbe::new(
            format!("{}/health", uri.trim_end_matches('/')),
            policy.per_attempt_timeout,
        );
        let waited = wait_until_healthy(&probe, &policy)
            .await?
            .into_result("registry")?;
        info!(registry = %uri, waited_ms = waited.as_millis() as u64, "registry is healthy");
    }

    let api = connect(&args.registry).await?;
    let config = args.config();

    tokio::select! {
        outcome = run_training(api.as_ref(), &config) => {
            let outcome = outcome.context("Training failed")?;
            println!("Run:       {}", outcome.run_id);
            print_version_line("Promoted:", &outcome.version);
            println!("Accuracy:  train {:.4}, test {:.4}", outcome.accuracy_train, outcome.accuracy_test);
            println!("Test data: {}", config.test_data.display());
            Ok(0)
        }
        _ = shutdown => {
            warn!("interrupted; the run stays RUNNING until its lease expires");
            Ok(exit_codes::INTERRUPTED)
        }
    }
}

async fn cmd_serve<F>(args: &ServeArgs, shutdown: F) -> Result<i32>
where
    F: Future<Output = ()>,
{
    let config = args.config()?;
    let api = connect(&args.registry).await?;
    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;

    run_serving(api, config, listener, shutdown)
        .await
        .context("Serving failed")?;
    Ok(0)
}

async fn cmd_orchestrate<F>(pipeline: &std::path::Path, shutdown: F) -> Result<i32>
where
    F: Future<Output = ()>,
{
    let spec = PipelineSpec::load(pipeline)
        .with_context(|| format!("Failed to load pipeline {}", pipeline.display()))?;
    let orchestrator = Orchestrator::new(spec)?;
    let order: Vec<String> = orchestrator
        .graph()
        .start_order()
        .map_err(PipelineError::from)?
        .into_iter()
        .map(|node| node.to_string())
        .collect();
    info!(order = %order.join(" -> "), "starting pipeline");

    let code = orchestrator.run(shutdown).await?;
    info!(exit_code = code, "pipeline finished");
    Ok(code)
}

fn print_version_line(label: &str, v: &ModelVersion) {
    println!(
        "{label:<10} {} v{} ({}) from run {}",
        v.name,
        v.version,
        v.stage.as_str(),
        v.run_id
    );
}

fn print_versions(versions: &[ModelVersion]) {
    println!(
        "{:<8} {:<11} {:<36} {:<20} DESCRIPTION",
        "VERSION", "STAGE", "RUN", "STAGE UPDATED"
    );
    for v in versions {
        println!(
            "{:<8} {:<11} {:<36} {:<20} {}",
            v.version,
            v.stage.as_str(),
            v.run_id.0,
            v.stage_updated_at.format("%Y-%m-%d %H:%M:%S"),
            v.description.as_deref().unwrap_or("")
        );
    }
}

async fn cmd_models(api: &dyn RegistryApi, action: ModelAction) -> Result<()> {
    match action {
        ModelAction::List => {
            let models = api.list_models().await?;
            if models.is_empty() {
                println!("No registered models");
                return Ok(());
            }
            for model in models {
                println!(
                    "{:<24} latest v{:<5} created {}",
                    model.name,
                    model.latest_version,
                    model.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        ModelAction::Versions { name } => {
            let versions = api.list_versions(&name).await?;
            if versions.is_empty() {
                println!("No versions of '{name}'");
                return Ok(());
            }
            print_versions(&versions);
        }
        ModelAction::Get { name, version } => {
            let v = api.get_version(&name, version).await?;
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
        ModelAction::Latest { name, stages } => {
            let filter = (!stages.is_empty()).then_some(stages.as_slice());
            let latest = api.get_latest_versions(&name, filter).await?;
            if latest.is_empty() {
                println!("No version of '{name}' occupies the requested stages");
                return Ok(());
            }
            print_versions(&latest);
        }
        ModelAction::Transition {
            name,
            version,
            stage,
            archive_previous,
        } => {
            let moved = mlgate_core::transition_stage(
                api,
                &name,
                version,
                stage,
                demotion_policy(archive_previous),
            )
            .await?;
            print_version_line("Moved:", &moved);
        }
        ModelAction::Describe {
            name,
            version,
            description,
        } => {
            let v = api
                .update_version_description(&name, version, description)
                .await?;
            println!(
                "{} v{}: {}",
                v.name,
                v.version,
                v.description.as_deref().unwrap_or("(no description)")
            );
        }
    }
    Ok(())
}

fn print_run_line(run: &RunRecord) {
    let accuracy = run
        .metrics
        .get("accuracy_test")
        .map(|a| format!("{a:.4}"))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<36} {:<9} {:<16} {:<20} {}",
        run.run_id.0,
        run.status.as_str(),
        run.experiment,
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        accuracy
    );
}

async fn cmd_runs(api: &dyn RegistryApi, action: RunAction) -> Result<()> {
    match action {
        RunAction::List { experiment } => {
            let runs = api.list_runs(experiment.as_deref()).await?;
            if runs.is_empty() {
                println!("No runs found");
                return Ok(());
            }
            println!(
                "{:<36} {:<9} {:<16} {:<20} ACCURACY_TEST",
                "RUN", "STATUS", "EXPERIMENT", "STARTED"
            );
            for run in &runs {
                print_run_line(run);
            }
        }
        RunAction::Get { run_id } => {
            let run = api.get_run(&RunId(run_id)).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
    }
    Ok(())
}

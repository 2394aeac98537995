//! mlgate registry daemon.
//!
//! Serves the registry API over HTTP from an embedded store and fails
//! abandoned runs once their lease runs out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mlgate_core::registry::serve;
use mlgate_core::{level_for_verbosity, RegistryApi, RegistryService, METRICS};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mlgate-registryd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "mlgate model registry daemon", long_about = None)]
struct Args {
    /// Listen address
    #[arg(long, env = "MLGATE_BIND", default_value = "0.0.0.0:5000")]
    bind: String,

    /// Backing store: mem:// or surrealkv://<dir>
    #[arg(long, env = "MLGATE_REGISTRY_STORE", default_value = "surrealkv://mlgate-data")]
    store: String,

    /// Seconds without a heartbeat before a RUNNING run is failed (0 disables)
    #[arg(long, env = "MLGATE_RUN_LEASE", default_value = "3600")]
    run_lease: u64,

    /// Seconds between lease sweeps
    #[arg(long, env = "MLGATE_SWEEP_INTERVAL", default_value = "60")]
    sweep_interval: u64,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    mlgate_core::init_tracing(args.json, level_for_verbosity(args.verbose));

    let service = RegistryService::open(&args.store)
        .await
        .with_context(|| format!("Failed to open registry store {}", args.store))?;
    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;

    run(service, listener, &args, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
    .await
}

async fn run<F>(service: RegistryService, listener: TcpListener, args: &Args, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    info!(%addr, store = %args.store, run_lease_secs = args.run_lease, "registry daemon started");

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = service.lease_sweeper(Duration::from_secs(args.run_lease));
    let sweep_interval = Duration::from_secs(args.sweep_interval.max(1));
    let sweep = tokio::spawn(sweeper.run(sweep_interval, stopped(stop_rx.clone())));

    let api: Arc<dyn RegistryApi> = Arc::new(service);
    let server = tokio::spawn(serve(listener, api, stopped(stop_rx)));

    shutdown.await;
    info!("shutting down registry");
    stop_tx.send_replace(true);

    server.await.context("Registry server task failed")??;
    sweep.await.context("Lease sweeper task failed")?;
    METRICS.flush();
    Ok(())
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tokio::sync::oneshot;

    #[test]
    fn args_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults_use_durable_store_and_hour_lease() {
        let args = Args::try_parse_from(["mlgate-registryd"]).unwrap();
        assert!(args.store.starts_with("surrealkv://"));
        assert_eq!(args.run_lease, 3600);
    }

    #[tokio::test]
    async fn serves_health_until_shutdown() {
        let args = Args::try_parse_from(["mlgate-registryd", "--store", "mem://"]).unwrap();
        let service = RegistryService::open(&args.store).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/health", listener.local_addr().unwrap());

        let (stop, stop_rx) = oneshot::channel::<()>();
        let daemon = tokio::spawn(async move {
            run(service, listener, &args, async move {
                let _ = stop_rx.await;
            })
            .await
        });

        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");

        stop.send(()).unwrap();
        daemon.await.unwrap().unwrap();
        assert!(reqwest::get(&url).await.is_err());
    }
}

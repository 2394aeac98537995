//! Pipeline orchestrator.
//!
//! Starts registry, training and serving in graph order, holding each node
//! until its dependencies satisfy their edge condition, then supervises the
//! children until the long-running ones end.
//!
//! Exit-code rules:
//! - training exiting non-zero is logged; the orchestrator keeps the
//!   long-running children up and reports the failure when they end
//! - registry or serving exiting stops every other child; the result is the
//!   first non-zero exit code observed
//! - registry exiting before every node has started is a failure even when
//!   its own exit code is 0
//! - the shutdown signal stops every child and yields 130
//! - a readiness gate that times out stops every child and fails with
//!   `TimedOut`

pub mod graph;
pub mod launcher;
pub mod pipeline;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::error::{exit_codes, PipelineError, Result};
use crate::obs;
use crate::readiness::{wait_until_healthy, HealthProbe, HttpHealthProbe};

pub use graph::{Condition, Edge, GraphError, NodeKind, PipelineGraph};
pub use launcher::{ProcessLauncher, RunningProcess, TokioLauncher};
pub use pipeline::{NodeSpec, PipelineSpec};

/// Builds the health probe for a node's `health_url`.
pub type ProbeFactory = Arc<dyn Fn(&str, Duration) -> Box<dyn HealthProbe> + Send + Sync>;

fn http_probe_factory() -> ProbeFactory {
    Arc::new(|url: &str, timeout: Duration| -> Box<dyn HealthProbe> {
        Box::new(HttpHealthProbe::new(url, timeout))
    })
}

type ChildExit = (NodeKind, Result<i32>);

pub struct Orchestrator {
    spec: PipelineSpec,
    graph: PipelineGraph,
    launcher: Arc<dyn ProcessLauncher>,
    probes: ProbeFactory,
}

impl Orchestrator {
    /// Validate `spec` and prepare to run it with real processes.
    pub fn new(spec: PipelineSpec) -> Result<Self> {
        Self::with_launcher(spec, Arc::new(TokioLauncher), http_probe_factory())
    }

    pub fn with_launcher(
        spec: PipelineSpec,
        launcher: Arc<dyn ProcessLauncher>,
        probes: ProbeFactory,
    ) -> Result<Self> {
        let graph = spec.graph()?;
        Ok(Self {
            spec,
            graph,
            launcher,
            probes,
        })
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Run the pipeline until it completes or `shutdown` resolves.
    ///
    /// Returns the process exit code the orchestrator should report.
    pub async fn run<F>(self, shutdown: F) -> Result<i32>
    where
        F: Future<Output = ()>,
    {
        let order = self.graph.start_order()?;
        info!(
            order = ?order.iter().map(|n| n.as_str()).collect::<Vec<_>>(),
            self_contained = self.spec.self_contained,
            "starting pipeline"
        );

        let mut sup = Supervisor::new();
        tokio::pin!(shutdown);

        for node in order {
            for edge in self.graph.dependencies_of(node) {
                if edge.condition != Condition::Healthy {
                    // Start-order edges are satisfied by graph order.
                    continue;
                }
                let gate = self.gate(edge.to);
                tokio::pin!(gate);
                loop {
                    tokio::select! {
                        ready = &mut gate => {
                            if let Err(e) = ready {
                                warn!(node = %node, dependency = %edge.to, error = %e, "dependency never became healthy");
                                sup.stop_all().await;
                                return Err(e);
                            }
                            break;
                        }
                        Some((exited, code)) = sup.exits.recv() => {
                            if let Some(code) = sup.record_exit(exited, code) {
                                warn!(node = %node, exited = %exited, "pipeline ended before it was fully started");
                                sup.stop_all().await;
                                return Ok(if code == 0 { exit_codes::FAILURE } else { code });
                            }
                        }
                        _ = &mut shutdown => {
                            info!("shutdown requested while gating");
                            sup.stop_all().await;
                            return Ok(exit_codes::INTERRUPTED);
                        }
                    }
                }
            }

            let Some(spec) = self.spec.node(node) else {
                continue;
            };
            if let Err(e) = sup.start(node, self.launcher.spawn(node, spec)) {
                sup.stop_all().await;
                return Err(e);
            }
        }

        loop {
            if sup.running.is_empty() {
                return Ok(sup.first_failure.unwrap_or(0));
            }
            tokio::select! {
                Some((exited, code)) = sup.exits.recv() => {
                    if let Some(code) = sup.record_exit(exited, code) {
                        sup.stop_all().await;
                        return Ok(code);
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    sup.stop_all().await;
                    return Ok(exit_codes::INTERRUPTED);
                }
            }
        }
    }

    async fn gate(&self, dependency: NodeKind) -> Result<()> {
        let url = self
            .spec
            .node(dependency)
            .and_then(|n| n.health_url.as_deref())
            .ok_or_else(|| PipelineError::Fatal(format!("{dependency} has no health_url")))?;
        let policy = self.spec.probe_policy();
        let probe = (self.probes)(url, policy.per_attempt_timeout);
        wait_until_healthy(probe.as_ref(), &policy)
            .await?
            .into_result(dependency.as_str())
            .map(|_| ())
    }
}

/// Owns the child supervisor tasks and the exit bookkeeping.
struct Supervisor {
    exits_tx: mpsc::UnboundedSender<ChildExit>,
    exits: mpsc::UnboundedReceiver<ChildExit>,
    stop_tx: watch::Sender<bool>,
    running: BTreeMap<NodeKind, JoinHandle<()>>,
    first_failure: Option<i32>,
}

impl Supervisor {
    fn new() -> Self {
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        Self {
            exits_tx,
            exits,
            stop_tx,
            running: BTreeMap::new(),
            first_failure: None,
        }
    }

    fn start(&mut self, node: NodeKind, spawned: Result<Box<dyn RunningProcess>>) -> Result<()> {
        let mut process = spawned?;
        obs::emit_child_started(node.as_str(), process.pid());

        let exits = self.exits_tx.clone();
        let mut stop = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let exited = tokio::select! {
                code = process.wait() => Some(code),
                _ = stop.changed() => None,
            };
            let code = match exited {
                Some(code) => code,
                None => match process.kill().await {
                    Ok(()) => process.wait().await,
                    Err(e) => Err(e),
                },
            };
            let _ = exits.send((node, code));
        });
        self.running.insert(node, handle);
        Ok(())
    }

    /// Book a child exit. `Some(code)` means the pipeline is over.
    fn record_exit(&mut self, node: NodeKind, code: Result<i32>) -> Option<i32> {
        self.running.remove(&node);
        let code = code.unwrap_or_else(|e| {
            warn!(node = %node, error = %e, "lost track of child");
            exit_codes::FAILURE
        });
        obs::emit_child_exited(node.as_str(), code);

        if code != 0 && self.first_failure.is_none() {
            self.first_failure = Some(code);
        }
        if node.is_long_running() {
            warn!(node = %node, code, "long-running child exited; stopping pipeline");
            return Some(self.first_failure.unwrap_or(0));
        }
        if code != 0 {
            warn!(node = %node, code, "one-shot child failed");
        }
        None
    }

    /// Stop every running child and wait for its supervisor task.
    async fn stop_all(&mut self) {
        self.stop_tx.send_replace(true);
        let (nodes, handles): (Vec<NodeKind>, Vec<_>) =
            std::mem::take(&mut self.running).into_iter().unzip();
        for (node, joined) in nodes.into_iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                warn!(node = %node, error = %e, "child supervisor panicked");
            }
        }
        // Drain; exits after a stop are expected and not failures.
        while let Ok((node, _)) = self.exits.try_recv() {
            info!(node = %node, "child stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;

    /// Exits with `code` after `after`, or runs until killed when `after` is `None`.
    #[derive(Clone, Copy)]
    struct Script {
        after: Option<Duration>,
        code: i32,
    }

    struct ScriptedProcess {
        script: Script,
        killed: bool,
    }

    #[async_trait]
    impl RunningProcess for ScriptedProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> Result<i32> {
            if self.killed {
                return Ok(137);
            }
            match self.script.after {
                Some(after) => {
                    tokio::time::sleep(after).await;
                    Ok(self.script.code)
                }
                None => std::future::pending().await,
            }
        }

        async fn kill(&mut self) -> Result<()> {
            self.killed = true;
            Ok(())
        }
    }

    struct ScriptedLauncher {
        scripts: BTreeMap<NodeKind, Script>,
        spawned: Mutex<Vec<NodeKind>>,
        created: Instant,
        spawned_at: Mutex<BTreeMap<NodeKind, Duration>>,
    }

    impl ProcessLauncher for ScriptedLauncher {
        fn spawn(&self, node: NodeKind, _spec: &NodeSpec) -> Result<Box<dyn RunningProcess>> {
            self.spawned.lock().unwrap().push(node);
            self.spawned_at
                .lock()
                .unwrap()
                .insert(node, self.created.elapsed());
            Ok(Box::new(ScriptedProcess {
                script: self.scripts[&node],
                killed: false,
            }))
        }
    }

    struct StaticProbe {
        healthy: bool,
    }

    #[async_trait]
    impl HealthProbe for StaticProbe {
        fn target(&self) -> &str {
            "static"
        }

        async fn check(&self) -> Result<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(PipelineError::TransientConnectivity("refused".into()))
            }
        }
    }

    fn probes(healthy: bool) -> ProbeFactory {
        Arc::new(move |_: &str, _: Duration| -> Box<dyn HealthProbe> {
            Box::new(StaticProbe { healthy })
        })
    }

    /// Refuses the first `failures` checks, counted across every instance.
    struct FlakyHealth {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl HealthProbe for FlakyHealth {
        fn target(&self) -> &str {
            "flaky"
        }

        async fn check(&self) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(PipelineError::TransientConnectivity("refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn flaky_health(failures: u32, calls: Arc<AtomicU32>) -> ProbeFactory {
        Arc::new(move |_: &str, _: Duration| -> Box<dyn HealthProbe> {
            Box::new(FlakyHealth {
                failures,
                calls: calls.clone(),
            })
        })
    }

    fn full_spec() -> PipelineSpec {
        PipelineSpec::from_toml_str(
            r#"
            [registry]
            command = ["mlgate-registryd"]
            health_url = "http://127.0.0.1:5000/health"
            [training]
            command = ["mlgate", "train"]
            [serving]
            command = ["mlgate", "serve"]
            [probe]
            interval = 1000
            per_attempt_timeout = 500
            max_attempts = 3
            "#,
        )
        .unwrap()
    }

    fn forever() -> Script {
        Script {
            after: None,
            code: 0,
        }
    }

    fn exits(secs: u64, code: i32) -> Script {
        Script {
            after: Some(Duration::from_secs(secs)),
            code,
        }
    }

    fn launcher(scripts: &[(NodeKind, Script)]) -> Arc<ScriptedLauncher> {
        Arc::new(ScriptedLauncher {
            scripts: scripts.iter().copied().collect(),
            spawned: Mutex::new(Vec::new()),
            created: Instant::now(),
            spawned_at: Mutex::new(BTreeMap::new()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn serving_exit_stops_pipeline_with_its_code() {
        let launcher = launcher(&[
            (NodeKind::Registry, forever()),
            (NodeKind::Training, exits(5, 0)),
            (NodeKind::Serving, exits(60, 3)),
        ]);
        let orch = Orchestrator::with_launcher(full_spec(), launcher.clone(), probes(true)).unwrap();

        let code = orch.run(std::future::pending()).await.unwrap();
        assert_eq!(code, 3);
        assert_eq!(
            *launcher.spawned.lock().unwrap(),
            vec![NodeKind::Registry, NodeKind::Training, NodeKind::Serving]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn training_failure_is_reported_after_serving_ends() {
        let launcher = launcher(&[
            (NodeKind::Registry, forever()),
            (NodeKind::Training, exits(5, 2)),
            (NodeKind::Serving, exits(30, 0)),
        ]);
        let orch = Orchestrator::with_launcher(full_spec(), launcher, probes(true)).unwrap();

        assert_eq!(orch.run(std::future::pending()).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_registry_times_out_before_training() {
        let launcher = launcher(&[
            (NodeKind::Registry, forever()),
            (NodeKind::Training, exits(5, 0)),
            (NodeKind::Serving, forever()),
        ]);
        let orch = Orchestrator::with_launcher(full_spec(), launcher.clone(), probes(false)).unwrap();

        let err = orch.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, PipelineError::TimedOut { attempts: 3, .. }));
        assert_eq!(err.exit_code(), exit_codes::TEMPFAIL);
        assert_eq!(*launcher.spawned.lock().unwrap(), vec![NodeKind::Registry]);
    }

    #[tokio::test(start_paused = true)]
    async fn training_waits_for_third_health_check() {
        let spec = PipelineSpec::from_toml_str(
            r#"
            [registry]
            command = ["mlgate-registryd"]
            health_url = "http://127.0.0.1:5000/health"
            [training]
            command = ["mlgate", "train"]
            [serving]
            command = ["mlgate", "serve"]
            [probe]
            interval = 10000
            per_attempt_timeout = 2000
            max_attempts = 5
            "#,
        )
        .unwrap();
        let launcher = launcher(&[
            (NodeKind::Registry, forever()),
            (NodeKind::Training, exits(5, 0)),
            (NodeKind::Serving, exits(60, 0)),
        ]);
        let calls = Arc::new(AtomicU32::new(0));
        let orch =
            Orchestrator::with_launcher(spec, launcher.clone(), flaky_health(2, calls.clone()))
                .unwrap();

        assert_eq!(orch.run(std::future::pending()).await.unwrap(), 0);
        assert_eq!(
            *launcher.spawned.lock().unwrap(),
            vec![NodeKind::Registry, NodeKind::Training, NodeKind::Serving]
        );
        let spawned_at = launcher.spawned_at.lock().unwrap();
        assert_eq!(spawned_at[&NodeKind::Registry], Duration::ZERO);
        assert_eq!(spawned_at[&NodeKind::Training], Duration::from_secs(20));
        assert_eq!(spawned_at[&NodeKind::Serving], Duration::from_secs(20));
        // Two refusals and one success gate training, one more success gates serving.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_exiting_cleanly_during_startup_fails_pipeline() {
        let launcher = launcher(&[
            (
                NodeKind::Registry,
                Script {
                    after: Some(Duration::from_millis(1500)),
                    code: 0,
                },
            ),
            (NodeKind::Training, exits(5, 0)),
            (NodeKind::Serving, forever()),
        ]);
        let orch = Orchestrator::with_launcher(full_spec(), launcher.clone(), probes(false)).unwrap();

        let code = orch.run(std::future::pending()).await.unwrap();
        assert_eq!(code, exit_codes::FAILURE);
        assert_eq!(*launcher.spawned.lock().unwrap(), vec![NodeKind::Registry]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_children() {
        let launcher = launcher(&[
            (NodeKind::Registry, forever()),
            (NodeKind::Training, exits(5, 0)),
            (NodeKind::Serving, forever()),
        ]);
        let orch = Orchestrator::with_launcher(full_spec(), launcher, probes(true)).unwrap();

        let code = orch
            .run(tokio::time::sleep(Duration::from_secs(120)))
            .await
            .unwrap();
        assert_eq!(code, exit_codes::INTERRUPTED);
    }

    #[tokio::test(start_paused = true)]
    async fn self_contained_returns_training_code() {
        let spec = PipelineSpec::from_toml_str(
            r#"
            self_contained = true
            [training]
            command = ["mlgate", "train", "--registry-uri", "mem://"]
            "#,
        )
        .unwrap();
        let launcher = launcher(&[(NodeKind::Training, exits(1, 4))]);
        let orch = Orchestrator::with_launcher(spec, launcher, probes(true)).unwrap();

        assert_eq!(orch.run(std::future::pending()).await.unwrap(), 4);
    }
}

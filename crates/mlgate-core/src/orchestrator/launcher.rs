//! Child process launching.

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::domain::error::{exit_codes, PipelineError, Result};
use crate::orchestrator::graph::NodeKind;
use crate::orchestrator::pipeline::NodeSpec;

/// A spawned pipeline process.
#[async_trait]
pub trait RunningProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit and return its exit code. Cancel-safe.
    async fn wait(&mut self) -> Result<i32>;

    /// Ask the process to terminate. Does not wait for it.
    async fn kill(&mut self) -> Result<()>;
}

/// Starts the process for one pipeline node.
pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, node: NodeKind, spec: &NodeSpec) -> Result<Box<dyn RunningProcess>>;
}

/// Launches real OS processes through `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn spawn(&self, node: NodeKind, spec: &NodeSpec) -> Result<Box<dyn RunningProcess>> {
        let program = spec
            .program()
            .ok_or_else(|| PipelineError::Fatal(format!("{node} node has no command")))?;
        let child = Command::new(program)
            .args(spec.args())
            .envs(&spec.env)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Fatal(format!("failed to start {node} ({program}): {e}")))?;
        debug!(node = %node, program, pid = ?child.id(), "spawned child");
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl RunningProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| PipelineError::Internal(format!("waiting for child: {e}")))?;
        // Killed by a signal: no code.
        Ok(status.code().unwrap_or(exit_codes::FAILURE))
    }

    async fn kill(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(PipelineError::Internal(format!("killing child: {e}"))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn sh(script: &str) -> NodeSpec {
        NodeSpec {
            command: vec!["sh".into(), "-c".into(), script.into()],
            env: BTreeMap::from([("MLGATE_TEST_CODE".to_string(), "7".to_string())]),
            health_url: None,
        }
    }

    #[tokio::test]
    async fn exit_code_and_env_propagate() {
        let mut proc = TokioLauncher
            .spawn(NodeKind::Training, &sh("exit $MLGATE_TEST_CODE"))
            .unwrap();
        assert!(proc.pid().is_some());
        assert_eq!(proc.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn killed_child_reports_failure() {
        let mut proc = TokioLauncher
            .spawn(NodeKind::Serving, &sh("sleep 30"))
            .unwrap();
        proc.kill().await.unwrap();
        assert_eq!(proc.wait().await.unwrap(), exit_codes::FAILURE);
    }

    #[tokio::test]
    async fn missing_program_is_fatal() {
        let spec = NodeSpec {
            command: vec!["/nonexistent/mlgate-missing".into()],
            env: BTreeMap::new(),
            health_url: None,
        };
        let err = TokioLauncher.spawn(NodeKind::Registry, &spec).err().unwrap();
        assert_eq!(err.exit_code(), 78);
    }
}

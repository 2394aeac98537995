//! Pipeline file (TOML).
//!
//! ```toml
//! [registry]
//! command = ["mlgate-registryd", "--bind", "127.0.0.1:5000"]
//! health_url = "http://127.0.0.1:5000/health"
//!
//! [training]
//! command = ["mlgate", "train", "--registry-uri", "http://127.0.0.1:5000"]
//!
//! [serving]
//! command = ["mlgate", "serve", "--registry-uri", "http://127.0.0.1:5000"]
//!
//! [probe]
//! interval = 2000
//! per_attempt_timeout = 2000
//! deadline = 120000
//! ```
//!
//! `[[edges]]` may be omitted; the canonical edges are assumed.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::error::{PipelineError, Result};
use crate::orchestrator::graph::{Condition, Edge, NodeKind, PipelineGraph, CANONICAL_EDGES};
use crate::retry::RetryPolicy;

/// How to launch one pipeline process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Probed when another node depends on this one being healthy.
    #[serde(default)]
    pub health_url: Option<String>,
}

impl NodeSpec {
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSpec {
    #[serde(default)]
    pub self_contained: bool,
    #[serde(default)]
    pub registry: Option<NodeSpec>,
    pub training: NodeSpec,
    #[serde(default)]
    pub serving: Option<NodeSpec>,
    /// Readiness gate timing for health-ordered edges.
    #[serde(default)]
    pub probe: Option<RetryPolicy>,
    #[serde(default)]
    pub edges: Option<Vec<Edge>>,
}

impl PipelineSpec {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| PipelineError::Fatal(format!("invalid pipeline file: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Fatal(format!("cannot read pipeline file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn node(&self, kind: NodeKind) -> Option<&NodeSpec> {
        match kind {
            NodeKind::Registry => self.registry.as_ref(),
            NodeKind::Training => Some(&self.training),
            NodeKind::Serving => self.serving.as_ref(),
        }
    }

    pub fn probe_policy(&self) -> RetryPolicy {
        self.probe.unwrap_or_default()
    }

    /// Validate node commands, health endpoints, edges and probe timing.
    pub fn graph(&self) -> Result<PipelineGraph> {
        let nodes: Vec<NodeKind> = [NodeKind::Registry, NodeKind::Training, NodeKind::Serving]
            .into_iter()
            .filter(|kind| self.node(*kind).is_some())
            .collect();
        let edges = match (&self.edges, self.self_contained) {
            (Some(edges), _) => edges.clone(),
            (None, true) => Vec::new(),
            (None, false) => CANONICAL_EDGES.to_vec(),
        };
        let graph = PipelineGraph::build(self.self_contained, nodes, edges)?;

        for kind in graph.nodes() {
            let Some(spec) = self.node(kind) else {
                continue;
            };
            if spec.program().map_or(true, |p| p.trim().is_empty()) {
                return Err(PipelineError::Fatal(format!(
                    "{kind} node needs a non-empty command"
                )));
            }
        }
        for kind in graph.nodes() {
            for edge in graph.dependencies_of(kind) {
                let needs_probe = edge.condition == Condition::Healthy;
                let has_probe = self.node(edge.to).and_then(|n| n.health_url.as_ref()).is_some();
                if needs_probe && !has_probe {
                    return Err(PipelineError::Fatal(format!(
                        "{} node needs health_url for edge {edge}",
                        edge.to
                    )));
                }
            }
        }
        self.probe_policy().validate()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const FULL: &str = r#"
        [registry]
        command = ["mlgate-registryd", "--bind", "127.0.0.1:5000"]
        health_url = "http://127.0.0.1:5000/health"

        [training]
        command = ["mlgate", "train"]
        env = { MLGATE_REGISTRY_URI = "http://127.0.0.1:5000" }

        [serving]
        command = ["mlgate", "serve"]

        [probe]
        interval = 10000
        per_attempt_timeout = 2000
        max_attempts = 5
    "#;

    #[test]
    fn full_pipeline_uses_canonical_edges() {
        let spec = PipelineSpec::from_toml_str(FULL).unwrap();
        let graph = spec.graph().unwrap();
        assert_eq!(graph.dependencies_of(NodeKind::Training).len(), 1);
        assert_eq!(spec.probe_policy().interval, Duration::from_secs(10));
        assert_eq!(spec.training.env["MLGATE_REGISTRY_URI"], "http://127.0.0.1:5000");
        assert_eq!(spec.training.args(), ["train".to_string()]);
    }

    #[test]
    fn explicit_edges_must_match() {
        let raw = format!(
            r#"{FULL}
            [[edges]]
            from = "training"
            to = "registry"
            condition = "healthy"
            "#
        );
        let err = PipelineSpec::from_toml_str(&raw)
            .unwrap()
            .graph()
            .unwrap_err();
        assert!(err.to_string().contains("missing edge"));
    }

    #[test]
    fn registry_without_health_url_is_rejected() {
        let raw = FULL.replace(r#"health_url = "http://127.0.0.1:5000/health""#, "");
        let err = PipelineSpec::from_toml_str(&raw)
            .unwrap()
            .graph()
            .unwrap_err();
        assert!(err.to_string().contains("health_url"));
    }

    #[test]
    fn self_contained_pipeline() {
        let spec = PipelineSpec::from_toml_str(
            r#"
            self_contained = true
            [training]
            command = ["mlgate", "train", "--registry-uri", "surrealkv:///var/lib/mlgate"]
            "#,
        )
        .unwrap();
        let graph = spec.graph().unwrap();
        assert_eq!(graph.nodes().collect::<Vec<_>>(), vec![NodeKind::Training]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = PipelineSpec::from_toml_str("[training]\ncmd = [\"x\"]\n").unwrap_err();
        assert_eq!(err.exit_code(), 78);
    }
}

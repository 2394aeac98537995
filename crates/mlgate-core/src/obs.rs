//! Structured observability hooks for mlgate lifecycle events.
//!
//! This module provides:
//! - A run-scoped span (`run_span`) for instrumenting a training run
//! - Emission functions for key lifecycle events: readiness probes, run
//!   start/finish, version registration, stage resolution, child processes
//!
//! Events are emitted at `info!` level with an `event` field so they can be
//! filtered from JSON logs (`--json`).

use std::time::Duration;

use tracing::{info, info_span, warn, Span};

use crate::metrics::METRICS;

/// Span that ties every event of one training run to its run id.
pub fn run_span(run_id: &str) -> Span {
    info_span!("mlgate.run", run_id = %run_id)
}

/// Emit event: a readiness probe failed and will be retried.
pub fn emit_probe_failed(target: &str, attempt: u32, error: &dyn std::fmt::Display) {
    METRICS.inc_probe_failures();
    info!(
        event = "readiness.probe_failed",
        target = %target,
        attempt = attempt,
        error = %error,
    );
}

/// Emit event: the readiness gate passed.
pub fn emit_target_ready(target: &str, attempts: u32, elapsed: Duration) {
    info!(
        event = "readiness.ready",
        target = %target,
        attempts = attempts,
        elapsed_ms = elapsed.as_millis() as u64,
    );
}

/// Emit event: training run created in the registry.
pub fn emit_run_started(run_id: &str, experiment: &str) {
    info!(event = "run.started", run_id = %run_id, experiment = %experiment);
}

/// Emit event: training run reached a terminal status.
pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

/// Emit event: a model version was registered (and possibly promoted).
pub fn emit_version_registered(name: &str, version: u64, stage: &str, run_id: &str) {
    METRICS.inc_versions_registered();
    info!(
        event = "model.version_registered",
        model = %name,
        version = version,
        stage = %stage,
        run_id = %run_id,
    );
}

/// Emit event: a version moved between stages.
pub fn emit_stage_transitioned(name: &str, version: u64, stage: &str) {
    info!(
        event = "model.stage_transitioned",
        model = %name,
        version = version,
        stage = %stage,
    );
}

/// Emit event: the resolver is still waiting for an artifact.
pub fn emit_resolve_retry(name: &str, selector: &str, attempt: u32, error: &dyn std::fmt::Display) {
    METRICS.inc_resolve_retries();
    info!(
        event = "resolver.retry",
        model = %name,
        selector = %selector,
        attempt = attempt,
        error = %error,
    );
}

/// Emit event: the resolver picked a version.
pub fn emit_resolved(name: &str, selector: &str, version: u64, attempts: u32) {
    info!(
        event = "resolver.resolved",
        model = %name,
        selector = %selector,
        version = version,
        attempts = attempts,
    );
}

/// Emit event: orchestrator started a child process.
pub fn emit_child_started(node: &str, pid: Option<u32>) {
    info!(event = "orchestrator.child_started", node = %node, pid = ?pid);
}

/// Emit event: orchestrator observed a child exit.
pub fn emit_child_exited(node: &str, exit_code: i32) {
    if exit_code == 0 {
        info!(event = "orchestrator.child_exited", node = %node, exit_code = exit_code);
    } else {
        warn!(event = "orchestrator.child_exited", node = %node, exit_code = exit_code);
    }
}

/// Emit event: run finalization error (warning level).
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}

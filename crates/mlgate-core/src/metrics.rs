//! Global atomic counters for mlgate observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a process shuts down).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    probe_failures: AtomicU64,
    resolve_retries: AtomicU64,
    versions_registered: AtomicU64,
    predictions_served: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            probe_failures: AtomicU64::new(0),
            resolve_retries: AtomicU64::new(0),
            versions_registered: AtomicU64::new(0),
            predictions_served: AtomicU64::new(0),
        }
    }

    pub fn inc_probe_failures(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolve_retries(&self) {
        self.resolve_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_versions_registered(&self) {
        self.versions_registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the number of rows scored by one inference request.
    pub fn add_predictions(&self, rows: u64) {
        self.predictions_served.fetch_add(rows, Ordering::Relaxed);
        tracing::trace!(metric = "predictions_served", rows, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            probe_failures = self.probe_failures(),
            resolve_retries = self.resolve_retries(),
            versions_registered = self.versions_registered(),
            predictions_served = self.predictions_served(),
        );
    }

    pub fn probe_failures(&self) -> u64 {
        self.probe_failures.load(Ordering::Relaxed)
    }

    pub fn resolve_retries(&self) -> u64 {
        self.resolve_retries.load(Ordering::Relaxed)
    }

    pub fn versions_registered(&self) -> u64 {
        self.versions_registered.load(Ordering::Relaxed)
    }

    pub fn predictions_served(&self) -> u64 {
        self.predictions_served.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.inc_probe_failures();
        m.inc_probe_failures();
        m.add_predictions(5);
        assert_eq!(m.probe_failures(), 2);
        assert_eq!(m.predictions_served(), 5);
        assert_eq!(m.versions_registered(), 0);
        m.flush();
    }
}

//! Abandoned-run sweeper.
//!
//! A training process that dies mid-run leaves its run `RUNNING` forever.
//! The daemon periodically fails runs whose last heartbeat (creation or any
//! metric/artifact write) is older than the lease.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mlgate_state::{RunId, RunLedger};
use tracing::{debug, info, warn};

use crate::domain::error::{PipelineError, Result};

pub struct LeaseSweeper {
    runs: Arc<dyn RunLedger>,
    lease: Duration,
}

impl LeaseSweeper {
    pub fn new(runs: Arc<dyn RunLedger>, lease: Duration) -> Self {
        Self { runs, lease }
    }

    /// Fail every stale run once. A zero lease disables the sweep.
    pub async fn sweep_once(&self) -> Result<Vec<RunId>> {
        if self.lease.is_zero() {
            return Ok(Vec::new());
        }
        let lease = chrono::Duration::from_std(self.lease)
            .map_err(|e| PipelineError::Fatal(format!("run lease out of range: {e}")))?;
        let cutoff = Utc::now().checked_sub_signed(lease).ok_or_else(|| {
            PipelineError::Fatal(format!("run lease {:?} is out of range", self.lease))
        })?;
        let expired = self.runs.expire_stale_runs(cutoff).await?;
        for run_id in &expired {
            info!(run_id = %run_id, lease_secs = self.lease.as_secs(), "expired abandoned run");
        }
        Ok(expired)
    }

    /// Sweep every `interval` until `shutdown` resolves.
    pub async fn run<F>(self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if self.lease.is_zero() {
            debug!("run lease disabled");
            shutdown.await;
            return;
        }
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "run lease sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mlgate_state::fakes::MemoryRunLedger;
    use mlgate_state::{NewRun, RunStatus, FAILURE_REASON_TAG};

    use super::*;

    #[tokio::test]
    async fn zero_lease_never_expires() {
        let ledger = Arc::new(MemoryRunLedger::new());
        ledger.create_run(NewRun::default()).await.unwrap();

        let sweeper = LeaseSweeper::new(ledger.clone(), Duration::ZERO);
        assert!(sweeper.sweep_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_run_is_failed() {
        let ledger = Arc::new(MemoryRunLedger::new());
        let run = ledger.create_run(NewRun::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sweeper = LeaseSweeper::new(ledger.clone(), Duration::from_millis(5));
        let expired = sweeper.sweep_once().await.unwrap();
        assert_eq!(expired, vec![run.run_id.clone()]);

        let record = ledger.get_run(&run.run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.tags.contains_key(FAILURE_REASON_TAG));
    }

    #[tokio::test]
    async fn lease_beyond_datetime_range_is_fatal() {
        let ledger = Arc::new(MemoryRunLedger::new());
        let run = ledger.create_run(NewRun::default()).await.unwrap();

        // About a million years: a valid chrono duration, but not a valid cutoff.
        let sweeper = LeaseSweeper::new(ledger.clone(), Duration::from_secs(31_536_000_000_000));
        let err = sweeper.sweep_once().await.unwrap_err();
        assert!(matches!(err, PipelineError::Fatal(_)));
        assert_eq!(
            ledger.get_run(&run.run_id).await.unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn fresh_run_survives() {
        let ledger = Arc::new(MemoryRunLedger::new());
        let run = ledger.create_run(NewRun::default()).await.unwrap();

        let sweeper = LeaseSweeper::new(ledger.clone(), Duration::from_secs(3600));
        assert!(sweeper.sweep_once().await.unwrap().is_empty());
        assert_eq!(
            ledger.get_run(&run.run_id).await.unwrap().status,
            RunStatus::Running
        );
    }
}

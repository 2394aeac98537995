//! Bounded retry combinator.
//!
//! One executor drives every polling loop in mlgate: the readiness gate in
//! front of the registry and the serving-side artifact resolver. Attempts
//! run at a fixed interval (no backoff) until the operation succeeds, fails
//! with a non-retryable error, or the configured attempt/time budget runs
//! out.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::domain::error::{PipelineError, Result};

/// Timing knobs for a bounded polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Grace period before the first attempt.
    #[serde(default, with = "duration_ms")]
    pub initial_delay: Duration,
    /// Pause between consecutive attempts.
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Upper bound on a single attempt; overruns count as a transient failure.
    #[serde(with = "duration_ms")]
    pub per_attempt_timeout: Duration,
    /// Give up after this many consecutive failed attempts.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Give up once this much time has passed since the loop started.
    #[serde(default, with = "duration_ms_opt")]
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            interval: Duration::from_secs(2),
            per_attempt_timeout: Duration::from_secs(2),
            max_attempts: None,
            deadline: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = timeout;
        self
    }

    /// A loop with neither an attempt cap nor a deadline would never give up.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts.is_none() && self.deadline.is_none() {
            return Err(PipelineError::Fatal(
                "retry policy needs max_attempts or a deadline".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(PipelineError::Fatal(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.interval.is_zero() || self.per_attempt_timeout.is_zero() {
            return Err(PipelineError::Fatal(
                "interval and per-attempt timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Successful outcome plus the cost of reaching it.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum RetryError {
    /// A non-retryable error ended the loop early.
    Aborted { error: PipelineError, attempts: u32 },
    /// Attempts or time ran out while the error was still retryable.
    Exhausted {
        last_error: PipelineError,
        attempts: u32,
        elapsed: Duration,
    },
}

impl RetryError {
    /// Collapse into the pipeline taxonomy: exhaustion becomes `TimedOut`.
    pub fn into_pipeline_error(self, what: &str) -> PipelineError {
        match self {
            RetryError::Aborted { error, .. } => error,
            RetryError::Exhausted {
                last_error,
                attempts,
                elapsed,
            } => PipelineError::TimedOut {
                what: what.to_string(),
                attempts,
                elapsed,
                last_error: last_error.to_string(),
            },
        }
    }
}

/// Fixed-interval async retry executor.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor;

impl RetryExecutor {
    /// Run `operation(attempt)` (1-based) until it succeeds or the policy gives up.
    ///
    /// `on_retry(&error, attempt)` fires after every retryable failure that
    /// will be followed by another attempt.
    pub async fn execute<Op, Fut, T, OnRetry>(
        policy: &RetryPolicy,
        mut operation: Op,
        mut on_retry: OnRetry,
    ) -> std::result::Result<Attempted<T>, RetryError>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        OnRetry: FnMut(&PipelineError, u32),
    {
        if let Err(error) = policy.validate() {
            return Err(RetryError::Aborted { error, attempts: 0 });
        }

        let start = Instant::now();
        if !policy.initial_delay.is_zero() {
            tokio::time::sleep(policy.initial_delay).await;
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome =
                match tokio::time::timeout(policy.per_attempt_timeout, operation(attempt)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PipelineError::TransientConnectivity(format!(
                        "attempt {attempt} exceeded {:?}",
                        policy.per_attempt_timeout
                    ))),
                };

            let error = match outcome {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    })
                }
                Err(error) if !error.retryable() => {
                    return Err(RetryError::Aborted {
                        error,
                        attempts: attempt,
                    })
                }
                Err(error) => error,
            };

            let elapsed = start.elapsed();
            let out_of_attempts = policy.max_attempts.is_some_and(|max| attempt >= max);
            let remaining = policy.deadline.map(|d| d.saturating_sub(elapsed));
            if out_of_attempts || remaining.is_some_and(|r| r.is_zero()) {
                return Err(RetryError::Exhausted {
                    last_error: error,
                    attempts: attempt,
                    elapsed,
                });
            }

            // The last pause is cut short so one attempt lands on the deadline.
            let delay = remaining.map_or(policy.interval, |r| r.min(policy.interval));
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after interval"
            );
            on_retry(&error, attempt);
            tokio::time::sleep(delay).await;
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::ZERO,
            interval: Duration::from_secs(10),
            per_attempt_timeout: Duration::from_secs(1),
            max_attempts: Some(5),
            deadline: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = RetryExecutor::execute(
            &policy(),
            move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PipelineError::TransientConnectivity("refused".into()))
                    } else {
                        Ok("up")
                    }
                }
            },
            |_, _| {},
        )
        .await
        .unwrap();

        assert_eq!(result.value, "up");
        assert_eq!(result.attempts, 3);
        assert_eq!(result.elapsed, Duration::from_secs(20));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_aborts_immediately() {
        let err = RetryExecutor::execute(
            &policy(),
            |_| async { Err::<(), _>(PipelineError::NotFound("v7".into())) },
            |_, _| panic!("must not retry"),
        )
        .await
        .unwrap_err();

        match err {
            RetryError::Aborted { error, attempts } => {
                assert!(matches!(error, PipelineError::NotFound(_)));
                assert_eq!(attempts, 1);
            }
            other => panic!("expected Aborted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempt_budget() {
        let mut retries = Vec::new();
        let err = RetryExecutor::execute(
            &policy().with_max_attempts(3),
            |_| async {
                Err::<(), _>(PipelineError::StageEmpty {
                    name: "clf-model".into(),
                    stage: "Staging".into(),
                })
            },
            |_, attempt| retries.push(attempt),
        )
        .await
        .unwrap_err();

        assert_eq!(retries, vec![1, 2]);
        let pe = err.into_pipeline_error("resolve clf-model");
        match pe {
            PipelineError::TimedOut { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_before_deadline_is_ready() {
        let mut p = policy();
        p.max_attempts = None;
        p.deadline = Some(Duration::from_secs(30));

        let start = Instant::now();
        let result = RetryExecutor::execute(
            &p,
            move |_| async move {
                if start.elapsed() >= Duration::from_secs(15) {
                    Ok(())
                } else {
                    Err(PipelineError::TransientConnectivity("down".into()))
                }
            },
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(result.elapsed, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn final_attempt_lands_on_deadline() {
        let mut p = policy();
        p.max_attempts = None;
        p.deadline = Some(Duration::from_secs(25));

        // Healthy after the last full interval tick (20s) but before the deadline.
        let start = Instant::now();
        let result = RetryExecutor::execute(
            &p,
            move |_| async move {
                if start.elapsed() >= Duration::from_secs(22) {
                    Ok(())
                } else {
                    Err(PipelineError::TransientConnectivity("down".into()))
                }
            },
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(result.attempts, 4);
        assert_eq!(result.elapsed, Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let mut p = policy();
        p.max_attempts = None;
        p.deadline = Some(Duration::from_secs(25));

        let err = RetryExecutor::execute(
            &p,
            |_| async { Err::<(), _>(PipelineError::TransientConnectivity("down".into())) },
            |_, _| {},
        )
        .await
        .unwrap_err();

        match err {
            RetryError::Exhausted {
                attempts, elapsed, ..
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(elapsed, Duration::from_secs(25));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_counts_as_transient() {
        let err = RetryExecutor::execute(
            &policy().with_max_attempts(1),
            |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            |_, _| {},
        )
        .await
        .unwrap_err();

        match err {
            RetryError::Exhausted { last_error, .. } => {
                assert!(matches!(last_error, PipelineError::TransientConnectivity(_)))
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unbounded_policy_is_fatal() {
        let mut p = policy();
        p.max_attempts = None;
        p.deadline = None;
        let err = RetryExecutor::execute(&p, |_| async { Ok(()) }, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err.into_pipeline_error("probe"),
            PipelineError::Fatal(_)
        ));
    }

    #[test]
    fn policy_deserializes_from_millis() {
        let p: RetryPolicy = serde_json::from_str(
            r#"{"interval": 500, "per_attempt_timeout": 250, "deadline": 10000}"#,
        )
        .unwrap();
        assert_eq!(p.interval, Duration::from_millis(500));
        assert_eq!(p.deadline, Some(Duration::from_secs(10)));
        assert_eq!(p.max_attempts, None);
        assert_eq!(p.initial_delay, Duration::ZERO);
    }
}

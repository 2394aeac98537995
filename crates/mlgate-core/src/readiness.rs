//! Readiness gate.
//!
//! A dependent process must not start until [`wait_until_healthy`] returns
//! [`Readiness::Ready`] for every health-ordered dependency. The probe is
//! side-effect free and recomputed on each attempt; nothing is cached.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::domain::error::{PipelineError, Result};
use crate::obs;
use crate::retry::{RetryError, RetryExecutor, RetryPolicy};

/// A side-effect-free health check against one target.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Human-readable target, used in logs.
    fn target(&self) -> &str;

    /// `Ok(())` iff the target is reachable and ready.
    async fn check(&self) -> Result<()>;
}

/// `GET <url>`; healthy on any 2xx status.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    fn target(&self) -> &str {
        &self.url
    }

    async fn check(&self) -> Result<()> {
        self.client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(|e| PipelineError::TransientConnectivity(e.to_string()))
    }
}

/// Outcome of the gate. Both variants report the cost of reaching them.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready {
        attempts: u32,
        elapsed: Duration,
    },
    TimedOut {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },
}

impl Readiness {
    /// Turn a `TimedOut` outcome into an error for callers that must abort.
    pub fn into_result(self, target: &str) -> Result<Duration> {
        match self {
            Readiness::Ready { elapsed, .. } => Ok(elapsed),
            Readiness::TimedOut {
                attempts,
                elapsed,
                last_error,
            } => Err(PipelineError::TimedOut {
                what: format!("health of {target}"),
                attempts,
                elapsed,
                last_error,
            }),
        }
    }
}

/// Poll `probe` per `policy` until it succeeds or the policy gives up.
///
/// Every probe failure counts as retryable: a 4xx from a half-started
/// server is as much "not ready yet" as a refused connection. Only an
/// invalid policy is an error.
pub async fn wait_until_healthy(probe: &dyn HealthProbe, policy: &RetryPolicy) -> Result<Readiness> {
    let target = probe.target().to_string();
    let outcome = RetryExecutor::execute(
        policy,
        move |_| async move {
            probe.check().await.map_err(|e| match e {
                PipelineError::TransientConnectivity(_) => e,
                other => PipelineError::TransientConnectivity(other.to_string()),
            })
        },
        |err, attempt| obs::emit_probe_failed(&target, attempt, err),
    )
    .await;

    match outcome {
        Ok(done) => {
            obs::emit_target_ready(&target, done.attempts, done.elapsed);
            Ok(Readiness::Ready {
                attempts: done.attempts,
                elapsed: done.elapsed,
            })
        }
        Err(RetryError::Exhausted {
            last_error,
            attempts,
            elapsed,
        }) => {
            warn!(
                event = "readiness.timed_out",
                target = %target,
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                last_error = %last_error,
            );
            Ok(Readiness::TimedOut {
                attempts,
                elapsed,
                last_error: last_error.to_string(),
            })
        }
        Err(RetryError::Aborted { error, .. }) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Fails the first `failures` checks, then succeeds.
    struct FlakyProbe {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        fn target(&self) -> &str {
            "flaky"
        }

        async fn check(&self) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(PipelineError::TransientConnectivity("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn gate_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::ZERO,
            interval: Duration::from_secs(10),
            per_attempt_timeout: Duration::from_secs(2),
            max_attempts: Some(5),
            deadline: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_third_probe_after_two_failures() {
        let probe = FlakyProbe {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let readiness = wait_until_healthy(&probe, &gate_policy()).await.unwrap();
        assert_eq!(
            readiness,
            Readiness::Ready {
                attempts: 3,
                elapsed: Duration::from_secs(20)
            }
        );
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_when_never_healthy() {
        let probe = FlakyProbe {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let readiness = wait_until_healthy(&probe, &gate_policy().with_max_attempts(2))
            .await
            .unwrap();
        match &readiness {
            Readiness::TimedOut {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(*attempts, 2);
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert!(matches!(
            readiness.into_result("flaky"),
            Err(PipelineError::TimedOut { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_delay_precedes_first_probe() {
        let probe = FlakyProbe {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        let readiness = wait_until_healthy(
            &probe,
            &gate_policy().with_initial_delay(Duration::from_secs(3)),
        )
        .await
        .unwrap();
        assert_eq!(
            readiness,
            Readiness::Ready {
                attempts: 1,
                elapsed: Duration::from_secs(3)
            }
        );
    }

    #[tokio::test]
    async fn http_probe_against_closed_port_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpHealthProbe::new(
            format!("http://{addr}/health"),
            Duration::from_millis(500),
        );
        let err = probe.check().await.unwrap_err();
        assert!(matches!(err, PipelineError::TransientConnectivity(_)));
    }
}

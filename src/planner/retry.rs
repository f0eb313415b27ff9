//! Retry with exponential backoff.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetrySpec;
use crate::error::{CloudError, DeployError, Result};

/// Bounded exponential backoff for transient cloud errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySpec::default())
    }
}

impl From<&RetrySpec> for RetryPolicy {
    fn from(spec: &RetrySpec) -> Self {
        Self {
            max_attempts: spec.max_attempts.max(1),
            base_delay: Duration::from_millis(spec.base_delay_ms),
            max_delay: Duration::from_millis(spec.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `f` until it succeeds, fails permanently, or the attempts run out.
    ///
    /// Only transient cloud errors are retried. When the budget is spent the
    /// last error is wrapped in [`CloudError::RetriesExhausted`].
    ///
    /// # Errors
    ///
    /// Returns the first permanent error, or `RetriesExhausted`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.as_cloud().is_some_and(CloudError::is_transient) {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                return Err(DeployError::Cloud(CloudError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                }));
            }

            let delay = self.delay_for(attempt);
            warn!(
                "{operation}: attempt {attempt}/{} failed ({err}), retrying in {}ms",
                self.max_attempts,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_delay_schedule() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(300));
        assert_eq!(p.delay_for(40), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = policy()
            .run("CreateCluster", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DeployError::from(CloudError::throttled("CreateCluster", "slow down")))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_permanent() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy()
            .run("CreateListener", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DeployError::from(CloudError::network("CreateListener", "reset")))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(DeployError::Cloud(e @ CloudError::RetriesExhausted { attempts: 4, .. })) => {
                assert!(!e.is_transient());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy()
            .run("CreateService", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DeployError::from(CloudError::access_denied("CreateService", "no")))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

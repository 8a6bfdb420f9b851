//! Remote price fetching with bounded retries.
//!
//! A [`PriceSource`] turns one batch into a [`FetchOutcome`]. Transient
//! failures are retried with exponential backoff plus jitter; a batch that
//! exhausts its attempts becomes `FetchOutcome::Failed` instead of an error
//! so the run can move on.

pub mod keepa;

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::ApiConfig;
use crate::emit;
use crate::error::FetchError;
use crate::metrics::events::FetchRetried;
use crate::planner::Batch;

pub use keepa::KeepaClient;

/// Result of fetching one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Raw product objects as returned by the API.
    Fetched(Vec<serde_json::Value>),
    /// Every attempt failed.
    Failed { attempts: u32, reason: String },
}

impl FetchOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed { .. })
    }
}

/// A remote source of current price statistics.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Check credentials before any side effect. An error aborts the run.
    async fn validate(&self) -> Result<(), FetchError>;

    /// Warm up the remote rate limiter. Failures are only logged.
    async fn prime(&self) {}

    /// Fetch current statistics for every identifier in `batch`.
    async fn fetch(&self, batch: &Batch, domain_id: u8) -> FetchOutcome;
}

/// Retry settings shared by the API clients.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts in total, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.initial_backoff(),
            max_jitter: config.max_jitter(),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt, self.max_jitter)
    }
}

/// `base * 2^attempt` plus uniform jitter in `[0, max_jitter)`.
///
/// `attempt` counts from zero.
pub fn backoff_delay(base: Duration, attempt: u32, max_jitter: Duration) -> Duration {
    let exponential = base.saturating_mul(1u32 << attempt.min(16));
    let jitter_ms = max_jitter.as_millis() as u64;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    } else {
        Duration::ZERO
    };
    exponential.saturating_add(jitter)
}

/// Run `attempt_fn` until it succeeds or the policy is exhausted.
pub async fn fetch_with_retry<F, Fut>(
    policy: &RetryPolicy,
    batch: usize,
    mut attempt_fn: F,
) -> FetchOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<serde_json::Value>, FetchError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut reason = String::new();

    for attempt in 0..max_attempts {
        match attempt_fn().await {
            Ok(items) => return FetchOutcome::Fetched(items),
            Err(e) => {
                reason = e.to_string();
                if attempt + 1 < max_attempts {
                    let delay = policy.delay(attempt);
                    warn!(
                        batch,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Fetch attempt failed, retrying"
                    );
                    emit!(FetchRetried {
                        attempt: attempt + 1,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                } else {
                    warn!(batch, attempt = attempt + 1, error = %e, "Fetch attempt failed");
                }
            }
        }
    }

    FetchOutcome::Failed {
        attempts: max_attempts,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0, Duration::ZERO), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1, Duration::ZERO), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2, Duration::ZERO), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let base = Duration::from_millis(100);
        let jitter = Duration::from_millis(50);
        for _ in 0..100 {
            let delay = backoff_delay(base, 1, jitter);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = fetch_with_retry(&policy(3), 0, || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FetchError::Status { status: 503 })
                } else {
                    Ok(vec![serde_json::json!({"asin": "A"})])
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcome,
            FetchOutcome::Fetched(vec![serde_json::json!({"asin": "A"})])
        );
    }

    #[tokio::test]
    async fn test_exhausted_attempts_yield_failed_outcome() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = fetch_with_retry(&policy(3), 7, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Api {
                    message: "quota".to_string(),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match outcome {
            FetchOutcome::Failed { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, "API error: quota");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}

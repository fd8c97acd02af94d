//! Bounded exponential backoff around one source fetch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dayledger_adapters::AdapterError;
use dayledger_core::SourceKind;
use dayledger_storage::RetryDisposition;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Pause after failed attempt number `attempt` (1-based): `base × 2^attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Source of the pause between attempts, swapped out in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Clone)]
pub struct RetryExecutor {
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryExecutor {
    pub fn new(policy: BackoffPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent. The last error is returned as is.
    pub async fn run<T, F, Fut>(&self, source: SourceKind, mut operation: F) -> Result<T, AdapterError>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, AdapterError>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(%source, attempt, "source fetch recovered");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let retryable = error.disposition() == RetryDisposition::Retryable;
                    if !retryable || attempt >= max_attempts {
                        warn!(%source, attempt, retryable, %error, "source fetch failed");
                        return Err(error);
                    }
                    let delay = self.policy.delay_after(attempt);
                    warn!(%source, attempt, delay_ms = delay.as_millis() as u64, %error, "source fetch failed, backing off");
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

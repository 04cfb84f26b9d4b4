//! Bounded retry with jittered exponential backoff.
//!
//! Only transport-level failures are retried; authentication and remote
//! command failures are final on the first occurrence.

use std::time::Duration;
use tracing::{debug, warn};

/// Errors that can report whether another attempt could plausibly succeed.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

/// Backoff schedule for transient session failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Symmetric random jitter fraction applied to each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), jittered so a fleet
    /// of failing hosts does not reconnect in lockstep.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.base_delay.as_secs_f64() * f64::from(1u32 << exp);
        let capped = base.min(self.max_delay.as_secs_f64());
        let spread = capped * self.jitter;
        let jittered = capped - spread + fastrand::f64() * spread * 2.0;
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

/// Run `operation` until it succeeds, fails terminally, or the retry
/// budget is exhausted. Returns the result together with the number of
/// attempts made.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> (Result<T, E>, u32)
where
    E: RetryableError + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if err.is_retryable() && attempt <= policy.max_retries => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    host = %what,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                debug!(host = %what, attempt, error = %err, "giving up");
                return (Err(err), attempt);
            }
        }
    }
}

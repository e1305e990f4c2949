//! Retry with exponential backoff for backend connections and queries.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Retry behavior for a class of operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Initial backend connection: fail within a few seconds so a bad
    /// connection string surfaces at startup instead of hanging.
    #[must_use]
    pub fn connect() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Individual store operation: a couple of quick attempts, then let the
    /// caller fall back.
    #[must_use]
    pub fn op() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }
}

/// Run `operation` until it succeeds or the policy's attempts are exhausted,
/// doubling the delay between attempts up to `max_delay`.
pub async fn with_retry<F, Fut, T, E>(name: &str, policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    // A zero-attempt policy still runs the operation once.
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt == max_attempts => return Err(err),
            Err(err) => {
                warn!(
                    operation = name,
                    attempt,
                    max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying"
                );
                sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }

    unreachable!("max_attempts is at least 1")
}

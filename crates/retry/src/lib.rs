//! Bounded retry with backoff, jitter, and a non-retryable escape.
//!
//! An operation run under [`retry`] reports each failure as either
//! [`RetryError::Transient`] (consumes attempt budget, retried after a
//! delay) or [`RetryError::Permanent`] (aborts immediately, remaining
//! budget ignored). A caller-supplied observer sees every transient
//! failure before the delay; it is diagnostics only and cannot alter
//! control flow.

use std::time::Duration;

use tracing::debug;

/// A failed attempt, tagged with whether it is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Retry after the backoff delay, while budget remains.
    Transient(E),
    /// Stop immediately and surface the error.
    Permanent(E),
}

impl<E> RetryError<E> {
    /// The inner error, regardless of tag.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Transient(e) | RetryError::Permanent(e) => e,
        }
    }
}

/// Retry schedule: attempt budget plus delay shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub min_delay: Duration,
    /// Cap on the backed-off delay.
    pub max_delay: Duration,
    /// Multiplier per subsequent attempt. 1.0 gives a fixed delay.
    pub backoff_factor: f64,
    /// Multiply each delay by a random factor in `[1, 2)` to spread
    /// concurrent retriers apart.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Conservative schedule for a single irreversible handshake:
    /// few attempts, fixed delay, no jitter.
    pub fn create_phase() -> Self {
        Self {
            max_attempts: 4,
            min_delay: Duration::from_millis(2500),
            max_delay: Duration::from_millis(2500),
            backoff_factor: 1.0,
            jitter: false,
        }
    }

    /// Lenient schedule for many independent concurrent operations:
    /// more attempts, doubling delay, jittered to avoid retry storms.
    pub fn upload_phase() -> Self {
        Self {
            max_attempts: 6,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }

    /// Calculates the delay before the retry following `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.min_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if !self.jitter {
            return Duration::from_secs_f64(capped);
        }
        // Random factor in [1, 2) from the clock's subsecond nanos.
        let frac = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / (u32::MAX as f64 + 1.0);
        Duration::from_secs_f64(capped * (1.0 + frac))
    }
}

/// Runs `op` under `policy`, sleeping between transient failures.
///
/// `op` receives the 1-based attempt number. `on_retry` is invoked with
/// each transient error before the delay. Exhausting the budget surfaces
/// the last transient error; a permanent error surfaces at once.
pub async fn retry<T, E, Op>(
    policy: &RetryPolicy,
    mut op: Op,
    mut on_retry: impl FnMut(&E),
) -> Result<T, E>
where
    Op: AsyncFnMut(u32) -> Result<T, RetryError<E>>,
{
    let budget = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(RetryError::Permanent(err)) => return Err(err),
            Err(RetryError::Transient(err)) => {
                if attempt >= budget {
                    return Err(err);
                }
                on_retry(&err);
                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

//! Retries with exponential, capped backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff as _;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Doubling delays from `initial_backoff`, capped at `max_backoff`. No
    /// jitter and no elapsed-time limit; `max_attempts` bounds the retries.
    pub fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff.min(self.max_backoff))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Where backoff delays are spent. Tests substitute a recorder.
#[async_trait]
pub trait Sleeper: Send + Sync + fmt::Debug {
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

/// Attempt counter for one retried operation.
pub struct Backoff {
    schedule: ExponentialBackoff,
    max_attempts: u32,
    attempts: u32,
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("max_attempts", &self.max_attempts)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { schedule: policy.schedule(), max_attempts: policy.max_attempts, attempts: 0 }
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a failure. Returns the delay before the next attempt, or
    /// `None` once the budget is spent.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.schedule.next_backoff()
    }
}

/// Sleeps for `delay` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn pause(sleeper: &dyn Sleeper, cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleeper.sleep(delay) => true,
    }
}

#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// Non-retryable error, or the budget ran out.
    Failed { attempts: u32, source: E },
    Cancelled,
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects,
/// or `policy.max_attempts` tries have been made.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(policy);
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        match backoff.on_failure() {
            Some(delay) if is_retryable(&err) => {
                warn!(attempt = backoff.attempts(), ?delay, error = %err, "retrying");
                if !pause(sleeper, cancel, delay).await {
                    return Err(RetryError::Cancelled);
                }
            }
            _ => return Err(RetryError::Failed { attempts: backoff.attempts(), source: err }),
        }
    }
}

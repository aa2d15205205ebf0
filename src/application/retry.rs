use crate::config::RetrySettings;
use crate::error::RailError;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exponential backoff schedule: `base * multiplier^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            multiplier: if multiplier.is_finite() {
                multiplier.max(1.0)
            } else {
                1.0
            },
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            settings.base_delay(),
            settings.max_delay(),
            settings.multiplier,
        )
    }

    /// Delay to wait after the failure of the zero-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

/// Returned when the executor is aborted before any attempt produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl From<Cancelled> for RailError {
    fn from(_: Cancelled) -> Self {
        RailError::Cancelled
    }
}

/// Runs fallible async operations under a [`RetryPolicy`].
///
/// Only errors the supplied classifier marks as retryable are retried. The
/// executor stops as soon as its cancellation token fires or its deadline
/// passes, returning the most recent error it saw.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True once the token has fired or the deadline has passed. An error
    /// returned while this holds may have interrupted an in-flight attempt.
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    async fn aborted(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    pub async fn execute<T, E, F, Fut, P>(&self, operation: &str, mut op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display + From<Cancelled>,
    {
        let mut last_err: Option<E> = None;
        let mut attempt: u32 = 0;

        loop {
            if self.is_aborted() {
                warn!(operation, attempt, "retry loop aborted before attempt");
                return Err(last_err.unwrap_or_else(|| Cancelled.into()));
            }

            let outcome = tokio::select! {
                biased;
                _ = self.aborted() => {
                    warn!(operation, attempt, "retry loop aborted during attempt");
                    return Err(last_err.unwrap_or_else(|| Cancelled.into()));
                }
                outcome = op(attempt) => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, attempts = attempt + 1, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !is_retryable(&err) {
                debug!(operation, attempt, error = %err, "error is not retryable");
                return Err(err);
            }

            attempt += 1;
            if attempt >= self.policy.max_attempts {
                warn!(operation, attempts = attempt, error = %err, "retries exhausted");
                return Err(err);
            }

            let delay = self.policy.delay_for(attempt - 1);
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after backoff"
            );
            last_err = Some(err);

            tokio::select! {
                biased;
                _ = self.aborted() => {
                    warn!(operation, attempt, "retry loop aborted during backoff");
                    return Err(last_err.unwrap_or_else(|| Cancelled.into()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

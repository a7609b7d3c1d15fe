//! Attempt classification and exponential backoff
//!
//! Every call against an external collaborator reports an [`Attempt`]. The
//! delay between attempts comes from the pure [`BackoffPolicy::delay_for`],
//! so schedules can be asserted without sleeping.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Outcome of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Ok(T),
    /// Worth trying again (timeout, connection reset, 429, 5xx)
    Retryable(String),
    /// Trying again cannot help this call (404, unparseable page)
    Fatal(String),
    /// The collaborator turned us away as a whole (401, 403); no later call
    /// will fare better
    Refused(String),
}

impl<T> Attempt<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempt<U> {
        match self {
            Attempt::Ok(value) => Attempt::Ok(f(value)),
            Attempt::Retryable(reason) => Attempt::Retryable(reason),
            Attempt::Fatal(reason) => Attempt::Fatal(reason),
            Attempt::Refused(reason) => Attempt::Refused(reason),
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Attempt<U>) -> Attempt<U> {
        match self {
            Attempt::Ok(value) => f(value),
            Attempt::Retryable(reason) => Attempt::Retryable(reason),
            Attempt::Fatal(reason) => Attempt::Fatal(reason),
            Attempt::Refused(reason) => Attempt::Refused(reason),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Attempt::Ok(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("{0}")]
    Fatal(String),

    #[error("refused: {0}")]
    Refused(String),
}

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1200),
            multiplier: 2,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Policy that never waits, for callers that handle pacing themselves
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Every delay a fully failing call would sleep through
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts.max(1)).map(|a| self.delay_for(a)).collect()
    }
}

/// Drive `op` until it succeeds, fails fatally, or runs out of attempts.
///
/// `op` receives the 1-based attempt number. Retry state lives entirely in
/// this call.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last = String::new();

    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Attempt::Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            },
            Attempt::Fatal(reason) => {
                debug!(label, attempt, reason = %reason, "Attempt failed permanently");
                return Err(RetryError::Fatal(reason));
            },
            Attempt::Refused(reason) => {
                warn!(label, attempt, reason = %reason, "Collaborator refused the request");
                return Err(RetryError::Refused(reason));
            },
            Attempt::Retryable(reason) => {
                if attempt < max_attempts {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    warn!(label, attempt, reason = %reason, "Attempt failed, no retries left");
                }
                last = reason;
            },
        }
    }

    Err(RetryError::Exhausted {
        attempts: max_attempts,
        last,
    })
}

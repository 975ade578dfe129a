//! Uniform retry wrapper for external-call stages.
//!
//! Every call into the mailbox or the language model goes through
//! [`retry`]: bounded attempts, a per-attempt timeout, exponential backoff
//! with jitter. Timeouts count as transient failures. Permanent failures
//! stop immediately.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{ExternalError, LlmError, MailboxError};

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based),
    /// before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Backoff plus up to 25% random jitter, never below a server hint.
    fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        let delay = base + jitter;
        match hint {
            Some(hint) => delay.max(hint.min(self.max_backoff)),
            None => delay,
        }
    }
}

/// Errors the retry wrapper knows how to classify.
pub trait TransientError: fmt::Display {
    fn is_transient(&self) -> bool;

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl TransientError for MailboxError {
    fn is_transient(&self) -> bool {
        MailboxError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        MailboxError::retry_after(self)
    }
}

impl TransientError for LlmError {
    fn is_transient(&self) -> bool {
        LlmError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        LlmError::retry_after(self)
    }
}

impl TransientError for ExternalError {
    fn is_transient(&self) -> bool {
        ExternalError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        ExternalError::retry_after(self)
    }
}

/// Why a single attempt failed.
#[derive(Debug)]
pub enum AttemptError<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: TransientError> AttemptError<E> {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Failed(e) => e.is_transient(),
            Self::TimedOut(_) => true,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Failed(e) => e.retry_after(),
            Self::TimedOut(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::TimedOut(after) => write!(f, "timed out after {after:?}"),
        }
    }
}

/// A successful call and how many attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// The call never succeeded.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last_error: AttemptError<E>,
}

impl<E: fmt::Display> fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up after {} attempt(s): {}", self.attempts, self.last_error)
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    operation: &str,
    mut op: F,
) -> Result<Retried<T>, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: TransientError,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let error = match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Ok(Err(e)) => AttemptError::Failed(e),
            Err(_) => AttemptError::TimedOut(timeout),
        };

        if !error.is_transient() || attempt >= max_attempts {
            return Err(Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let delay = policy.delay(attempt, error.retry_after());
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

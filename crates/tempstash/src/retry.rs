//! Retry executor with exponential backoff and jitter.
//!
//! The executor knows nothing about the operation it runs. It invokes it up
//! to [`RetryPolicy::attempts`] times, sleeping [`RetryPolicy::backoff`]
//! between failures. The sleep is cut short when the [`Context`] is done, in
//! which case the most recent failure is reported rather than a
//! cancellation error.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::context::Context;

/// Retry policy for the write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero is treated as one.
    pub attempts: u32,
    /// Base delay in milliseconds; the wait after attempt `i` starts at `base * 2^i`.
    pub base_delay_ms: u64,
    /// Upper bound of the random jitter as a fraction of the exponential delay.
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Creates a policy with the default jitter ratio of one half.
    #[must_use]
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
            jitter_ratio: 0.5,
        }
    }

    /// A single attempt, no waiting.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            attempts: 1,
            base_delay_ms: 0,
            jitter_ratio: 0.0,
        }
    }

    /// Short delays for local backends and tests.
    #[must_use]
    pub fn fast() -> Self {
        Self::new(3, Duration::from_millis(1))
    }

    /// Sets the jitter ratio. Values outside `[0, 1]` are clamped when delays are computed.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Number of attempts actually made, never less than one.
    #[must_use]
    pub fn effective_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Exponential part of the wait after the 1-indexed `attempt`.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Full wait after the 1-indexed `attempt`: `base * 2^attempt` plus
    /// uniform jitter in `[0, base * 2^attempt * jitter_ratio)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        let ratio = if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let cap = Duration::try_from_secs_f64(base.as_secs_f64() * ratio).unwrap_or(Duration::ZERO);
        let cap_nanos = u64::try_from(cap.as_nanos()).unwrap_or(u64::MAX);
        if cap_nanos == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..cap_nanos);
        base.saturating_add(Duration::from_nanos(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Result of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success(T),
    /// Every attempt failed.
    Exhausted {
        /// The failure of the final attempt.
        error: E,
        /// Total number of attempts made.
        attempts: u32,
    },
    /// The context finished during a backoff wait.
    Interrupted {
        /// The failure of the most recent attempt.
        error: E,
        /// Attempts made before the interruption.
        attempts: u32,
    },
    /// An attempt failed with an error not worth retrying.
    Aborted {
        /// The permanent failure.
        error: E,
        /// Attempts made, including the one that aborted.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Number of attempts made, or `None` on success.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Success(_) => None,
            Self::Exhausted { attempts, .. }
            | Self::Interrupted { attempts, .. }
            | Self::Aborted { attempts, .. } => Some(*attempts),
        }
    }

    /// Converts to a `Result`, keeping the last failure in every failure case.
    #[allow(clippy::missing_errors_doc)]
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Exhausted { error, .. }
            | Self::Interrupted { error, .. }
            | Self::Aborted { error, .. } => Err(error),
        }
    }
}

/// Execute an async operation under `policy`.
///
/// `operation` receives the 1-indexed attempt number. On failure with
/// attempts remaining, waits [`RetryPolicy::backoff`] or until `ctx` is
/// done, whichever comes first.
pub async fn retry<T, E, Fut, F>(
    ctx: &Context,
    policy: &RetryPolicy,
    operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(ctx, policy, operation, |_| true).await
}

/// Like [`retry`], but stops at the first error for which `retryable`
/// returns false and reports it as [`RetryOutcome::Aborted`].
pub async fn retry_if<T, E, Fut, F, P>(
    ctx: &Context,
    policy: &RetryPolicy,
    mut operation: F,
    retryable: P,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let attempts = policy.effective_attempts();
    let mut attempt: u32 = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return RetryOutcome::Success(value),
            Err(error) => {
                if !retryable(&error) {
                    return RetryOutcome::Aborted {
                        error,
                        attempts: attempt,
                    };
                }
                if attempt >= attempts {
                    return RetryOutcome::Exhausted {
                        error,
                        attempts: attempt,
                    };
                }

                let delay = policy.backoff(attempt);
                tokio::select! {
                    biased;
                    () = ctx.done() => {
                        return RetryOutcome::Interrupted {
                            error,
                            attempts: attempt,
                        };
                    },
                    () = tokio::time::sleep(delay) => {},
                }
                attempt = attempt.saturating_add(1);
            },
        }
    }
}

//! Cancellation and deadline propagation for stash operations.
//!
//! A [`Context`] travels with every facade call. Backoff waits inside the
//! retry executor and backend calls both stop as soon as the context is
//! done, which happens when its token is cancelled or its deadline passes.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{StashError, StashResult};

/// Cancellation signal plus optional deadline.
///
/// Cheap to clone; clones share the same cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done unless cancelled explicitly.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that becomes done after `timeout` elapses.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline_in(timeout)
    }

    /// A context driven by an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Set an absolute deadline. An earlier existing deadline is kept.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Set a deadline relative to now. An earlier existing deadline is kept.
    #[must_use]
    pub fn deadline_in(self, timeout: Duration) -> Self {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(far_future);
        self.with_deadline(deadline)
    }

    /// The deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A handle to the underlying cancellation token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the context is already cancelled or past its deadline.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {},
                    () = tokio::time::sleep_until(deadline) => {},
                }
            },
            None => self.token.cancelled().await,
        }
    }

    /// Race `fut` against this context.
    ///
    /// Returns [`StashError::Cancelled`] if the context finishes first; `fut`
    /// is dropped at that point.
    ///
    /// # Errors
    ///
    /// Propagates the future's own error, or [`StashError::Cancelled`].
    pub async fn run<T, F>(&self, fut: F) -> StashResult<T>
    where
        F: Future<Output = StashResult<T>>,
    {
        if self.is_done() {
            return Err(StashError::Cancelled);
        }
        tokio::select! {
            biased;
            () = self.done() => Err(StashError::Cancelled),
            result = fut => result,
        }
    }
}

/// Roughly thirty years out; matches what tokio uses for unbounded sleeps.
fn far_future() -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_secs(86_400 * 365 * 30))
        .unwrap_or(now)
}

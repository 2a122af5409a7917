//! Stash error types.

/// Errors from stash operations.
#[derive(Debug, thiserror::Error)]
pub enum StashError {
    /// The backend is unreachable or failed its liveness check.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backing relation or its indices could not be created.
    #[error("schema error: {0}")]
    Schema(String),

    /// A payload could not be encoded to its stored text form.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A single insert attempt failed.
    #[error("insert error: {0}")]
    Insert(String),

    /// A query failed. Queries are never retried.
    #[error("query error: {0}")]
    Query(String),

    /// A delete failed. Deletes are never retried.
    #[error("delete error: {0}")]
    Delete(String),

    /// Every retry attempt failed; carries the last underlying failure.
    #[error("gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The failure reported by the final attempt.
        #[source]
        source: Box<StashError>,
    },

    /// The operation's context was cancelled or its deadline elapsed.
    #[error("operation cancelled")]
    Cancelled,

    /// The backend handle has been released.
    #[error("stash is closed")]
    Closed,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StashError {
    /// Returns the innermost failure, unwrapping [`StashError::RetryExhausted`].
    #[must_use]
    pub fn root_cause(&self) -> &StashError {
        match self {
            Self::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl StashError {
    /// Whether another attempt could succeed. Closed handles, bad payloads,
    /// bad configuration, and cancellation are permanent.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Closed | Self::Serialization(_) | Self::Config(_) | Self::Cancelled
        )
    }
}

impl From<serde_json::Error> for StashError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for stash operations.
pub type StashResult<T> = Result<T, StashError>;

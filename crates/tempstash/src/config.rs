//! Stash configuration.
//!
//! Every field has a default, so a partial TOML document is enough:
//!
//! ```toml
//! schema_timeout_secs = 10
//!
//! [retry]
//! attempts = 5
//!
//! [dispatch]
//! workers = 8
//! queue_capacity = 4096
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StashError, StashResult};
use crate::retry::RetryPolicy;

/// Top-level configuration for a [`Stash`](crate::Stash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StashConfig {
    /// Retry policy for inserts.
    pub retry: RetryPolicy,
    /// Backend connection pool.
    pub pool: PoolConfig,
    /// Fire-and-forget write queue.
    pub dispatch: DispatchConfig,
    /// Ceiling on schema creation at construction time.
    pub schema_timeout_secs: u64,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pool: PoolConfig::default(),
            dispatch: DispatchConfig::default(),
            schema_timeout_secs: 10,
        }
    }
}

impl StashConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`StashError::Config`] on malformed TOML or invalid values.
    pub fn from_toml_str(raw: &str) -> StashResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| StashError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Schema creation timeout.
    #[must_use]
    pub fn schema_timeout(&self) -> Duration {
        Duration::from_secs(self.schema_timeout_secs)
    }

    /// Reject values the stash cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`StashError::Config`] naming the first offending field.
    pub fn validate(&self) -> StashResult<()> {
        if self.dispatch.workers == 0 {
            return Err(StashError::Config("dispatch.workers must be at least 1".into()));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(StashError::Config(
                "dispatch.queue_capacity must be at least 1".into(),
            ));
        }
        if self.pool.max_open == 0 {
            return Err(StashError::Config("pool.max_open must be at least 1".into()));
        }
        if self.retry.jitter_ratio.is_nan() || self.retry.jitter_ratio < 0.0 {
            return Err(StashError::Config(
                "retry.jitter_ratio must be a non-negative number".into(),
            ));
        }
        Ok(())
    }
}

/// Connection pool limits for network-style backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum simultaneously open connections.
    pub max_open: usize,
    /// Maximum idle connections kept for reuse.
    pub max_idle: usize,
    /// Connections older than this are closed instead of reused.
    pub max_lifetime_secs: u64,
    /// Ceiling on the liveness check performed at connect time.
    pub connect_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 5,
            max_idle: 2,
            max_lifetime_secs: 300,
            connect_timeout_secs: 5,
        }
    }
}

impl PoolConfig {
    /// Connection lifetime ceiling.
    #[must_use]
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    /// Liveness check timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Bounds for the fire-and-forget write path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Worker tasks draining the queue.
    pub workers: usize,
    /// Pending writes accepted before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

//! Tempstash: namespaced scratch storage over a relational backend.
//!
//! Callers stash keyed text or JSON payloads under a namespace and read them
//! back by namespace, key, and recency. The crate owns the parts with real
//! decisions in them:
//!
//! - [`retry`]: bounded retries with exponential backoff and jitter,
//!   cut short by a [`Context`]
//! - [`dispatch`]: a bounded, failure-isolated queue for fire-and-forget writes
//! - [`query`]: a compiler from sparse [`QueryFilter`]s to ordered, limited plans
//!
//! [`Stash`] composes them over a [`Backend`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use tempstash::{Context, QueryFilter, Stash, StashedItem};
//!
//! # async fn example() -> tempstash::StashResult<()> {
//! let stash = Stash::new("sqlite://./scratch.db").await?;
//! let ctx = Context::background();
//!
//! let id = stash
//!     .put_sync(&ctx, StashedItem::new("debug", "snapshot").with_key("step-1"))
//!     .await?;
//!
//! let recent = stash
//!     .query(&ctx, &QueryFilter::new().namespace("debug").limit(10))
//!     .await?;
//! assert!(recent.iter().any(|r| r.id == id));
//!
//! stash.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - **`sqlite`** (default): the pooled `SQLite` backend
//! - **`libsql`**: the remote libSQL backend (`libsql://host?authToken=...`)

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod backend;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod query;
pub mod record;
pub mod retry;

mod stash;

pub use backend::{Backend, MemoryBackend};
#[cfg(feature = "libsql")]
pub use backend::LibsqlBackend;
#[cfg(feature = "sqlite")]
pub use backend::SqliteBackend;
pub use config::{DispatchConfig, PoolConfig, StashConfig};
pub use context::Context;
pub use error::{StashError, StashResult};
pub use query::{DEFAULT_LIMIT, QueryFilter, QueryPlan};
pub use record::{Data, Record, StashedItem, marshal};
pub use retry::{RetryOutcome, RetryPolicy};
pub use stash::{Stash, StashBuilder};

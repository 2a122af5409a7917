//! Storage backends.
//!
//! The [`Backend`] trait is the seam between the stash and the relational
//! store holding the `stash(id, namespace, name, key, data, created_at)`
//! relation. Implementations:
//!
//! - **In-memory** (always available): for tests and ephemeral use
//! - **`SQLite`** (behind the `sqlite` feature): pooled, on-disk
//! - **libSQL** (behind the `libsql` feature): remote, over HTTP
//!
//! Backends are shared by concurrent callers and must do their own
//! synchronization.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PoolConfig;
use crate::error::{StashError, StashResult};
use crate::query::QueryPlan;
use crate::record::{NewRecord, Record};

#[cfg(feature = "libsql")]
mod libsql;
mod memory;
#[cfg(any(feature = "sqlite", feature = "libsql"))]
mod schema;
#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "libsql")]
pub use self::libsql::LibsqlBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Relational storage for stash records.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Liveness check.
    async fn ping(&self) -> StashResult<()>;

    /// Create the relation and its indices if absent. Idempotent.
    async fn ensure_schema(&self) -> StashResult<()>;

    /// Insert one row under a freshly generated unique ID and return the ID.
    async fn insert(&self, record: NewRecord<'_>) -> StashResult<String>;

    /// Execute a compiled plan, newest first.
    async fn query(&self, plan: &QueryPlan) -> StashResult<Vec<Record>>;

    /// Delete the rows of `namespace`, or every row when `None`.
    /// Returns the number of rows removed.
    async fn delete(&self, namespace: Option<&str>) -> StashResult<u64>;

    /// Release the handle. Calling it again is a no-op.
    async fn close(&self) -> StashResult<()>;
}

/// Open the backend named by `url`.
///
/// | URL | Backend |
/// |-----|---------|
/// | `memory://`, `mem://` | [`MemoryBackend`] |
/// | `sqlite://<path>`, `sqlite:<path>` | [`SqliteBackend`] |
/// | `libsql://<host>`, `https://<host>`, `http://<host>` | `LibsqlBackend` |
///
/// libSQL URLs carry their auth token as `?authToken=<token>`.
///
/// # Errors
///
/// Returns [`StashError::Connection`] for unknown schemes or when the
/// backend fails its liveness check.
pub async fn connect(url: &str, pool: &PoolConfig) -> StashResult<Arc<dyn Backend>> {
    if url == "memory://" || url == "mem://" {
        return Ok(Arc::new(MemoryBackend::new()));
    }

    if let Some(path) = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
    {
        return connect_sqlite(path, pool).await;
    }

    if ["libsql://", "https://", "http://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
    {
        return connect_libsql(url, pool).await;
    }

    Err(StashError::Connection(format!(
        "unsupported backend url: {}",
        redact(url)
    )))
}

#[cfg(feature = "sqlite")]
async fn connect_sqlite(path: &str, pool: &PoolConfig) -> StashResult<Arc<dyn Backend>> {
    Ok(Arc::new(SqliteBackend::connect(path, pool.clone()).await?))
}

#[cfg(not(feature = "sqlite"))]
async fn connect_sqlite(_path: &str, _pool: &PoolConfig) -> StashResult<Arc<dyn Backend>> {
    Err(StashError::Connection(
        "sqlite support not compiled in (enable the `sqlite` feature)".into(),
    ))
}

#[cfg(feature = "libsql")]
async fn connect_libsql(url: &str, pool: &PoolConfig) -> StashResult<Arc<dyn Backend>> {
    Ok(Arc::new(LibsqlBackend::connect(url, pool.clone()).await?))
}

#[cfg(not(feature = "libsql"))]
async fn connect_libsql(_url: &str, _pool: &PoolConfig) -> StashResult<Arc<dyn Backend>> {
    Err(StashError::Connection(
        "libsql support not compiled in (enable the `libsql` feature)".into(),
    ))
}

/// Strip anything after `?` so auth tokens in query strings stay out of errors and logs.
pub(crate) fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(head, _)| head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_urls() {
        let pool = PoolConfig::default();
        assert!(connect("memory://", &pool).await.is_ok());
        assert!(connect("mem://", &pool).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_scheme_is_a_connection_error() {
        let err = connect("postgres://db.example.com?password=secret", &PoolConfig::default())
            .await
            .err()
            .unwrap();
        match err {
            StashError::Connection(msg) => {
                assert!(msg.contains("postgres://db.example.com"));
                assert!(!msg.contains("secret"));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(not(feature = "libsql"))]
    #[tokio::test]
    async fn libsql_urls_need_the_feature() {
        let err = connect("libsql://db.example.com?authToken=secret", &PoolConfig::default())
            .await
            .err()
            .unwrap();
        match err {
            StashError::Connection(msg) => assert!(msg.contains("`libsql` feature"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn redact_drops_query_string() {
        assert_eq!(redact("x://host?token=1"), "x://host");
        assert_eq!(redact("x://host"), "x://host");
    }
}

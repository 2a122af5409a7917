//! `SQLite` backend with a small bounded connection pool.
//!
//! Blocking `SQLite` calls run on tokio's blocking pool. A semaphore caps the
//! number of open connections; up to `max_idle` connections are kept for
//! reuse until they reach `max_lifetime`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};
use uuid::Uuid;

use super::Backend;
use super::schema::{CREATE_TABLE, DELETE_ALL, DELETE_NAMESPACE, INSERT, RawRow, into_records};
use crate::config::PoolConfig;
use crate::error::{StashError, StashResult};
use crate::query::{QueryPlan, SqlParam};
use crate::record::{NewRecord, Record};

/// Busy timeout applied to every connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pooled `SQLite` backend.
pub struct SqliteBackend {
    path: Arc<str>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<PooledConnection>>>,
    closed: AtomicBool,
}

struct PooledConnection {
    conn: Connection,
    opened: Instant,
}

impl SqliteBackend {
    /// Open a pool on the database file at `path` and ping it.
    ///
    /// # Errors
    ///
    /// Returns [`StashError::Connection`] if the database cannot be opened or
    /// the ping does not answer within `config.connect_timeout_secs`.
    pub async fn connect(path: &str, config: PoolConfig) -> StashResult<Self> {
        if path.is_empty() || path == ":memory:" {
            return Err(StashError::Connection(
                "sqlite backend needs a file path; use memory:// for an in-process store".into(),
            ));
        }

        let backend = Self {
            path: Arc::from(path),
            permits: Arc::new(Semaphore::new(config.max_open.max(1))),
            config,
            idle: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        };

        let timeout = backend.config.connect_timeout();
        match tokio::time::timeout(timeout, backend.ping()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                backend.close().await?;
                return Err(match e {
                    StashError::Connection(_) => e,
                    other => StashError::Connection(other.to_string()),
                });
            },
            Err(_) => {
                backend.close().await?;
                return Err(StashError::Connection(format!(
                    "ping timed out after {}s",
                    timeout.as_secs()
                )));
            },
        }

        info!(path = %backend.path, max_open = backend.config.max_open, "sqlite backend connected");
        Ok(backend)
    }

    /// Run `f` on a pooled connection.
    ///
    /// The permit travels with the blocking job, so the open-connection cap
    /// holds even if the calling future is dropped mid-flight.
    async fn with_conn<T, F>(&self, wrap: fn(String) -> StashError, f: F) -> StashResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(StashError::Closed);
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StashError::Closed)?;

        let reused = self.take_idle()?;
        let path = Arc::clone(&self.path);
        let idle = Arc::clone(&self.idle);
        let max_idle = self.config.max_idle;
        let max_lifetime = self.config.max_lifetime();

        let job = move || {
            let pooled = match reused {
                Some(pooled) => pooled,
                None => PooledConnection {
                    conn: open(&path)?,
                    opened: Instant::now(),
                },
            };
            let result = f(&pooled.conn);
            release(&idle, pooled, max_idle, max_lifetime, permit);
            result
        };

        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| wrap(format!("sqlite task failed: {e}")))?
            .map_err(|e| wrap(e.to_string()))
    }

    fn take_idle(&self) -> StashResult<Option<PooledConnection>> {
        let mut idle = self
            .idle
            .lock()
            .map_err(|e| StashError::Connection(e.to_string()))?;
        let max_lifetime = self.config.max_lifetime();
        while let Some(pooled) = idle.pop() {
            if pooled.opened.elapsed() < max_lifetime {
                return Ok(Some(pooled));
            }
            debug!("dropping expired sqlite connection");
        }
        Ok(None)
    }
}

/// Return a connection to the idle list if there is room and it is still young.
fn release(
    idle: &Mutex<Vec<PooledConnection>>,
    pooled: PooledConnection,
    max_idle: usize,
    max_lifetime: Duration,
    permit: OwnedSemaphorePermit,
) {
    // A closed semaphore means the pool is shutting down.
    if !permit.semaphore().is_closed() && pooled.opened.elapsed() < max_lifetime {
        if let Ok(mut idle) = idle.lock() {
            if idle.len() < max_idle {
                idle.push(pooled);
            }
        }
    }
    drop(permit);
}

fn open(path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    Ok(conn)
}

fn to_value(param: &SqlParam) -> Value {
    match param {
        SqlParam::Text(s) => Value::Text(s.clone()),
        SqlParam::Integer(n) => Value::Integer(*n),
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn ping(&self) -> StashResult<()> {
        self.with_conn(StashError::Connection, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
        })
        .await
    }

    async fn ensure_schema(&self) -> StashResult<()> {
        self.with_conn(StashError::Schema, |conn| conn.execute_batch(CREATE_TABLE))
            .await
    }

    async fn insert(&self, record: NewRecord<'_>) -> StashResult<String> {
        let id = Uuid::new_v4().to_string();
        let row = [
            id.clone(),
            record.namespace.to_owned(),
            record.name.to_owned(),
            record.key.to_owned(),
            record.data.to_owned(),
        ];
        self.with_conn(StashError::Insert, move |conn| {
            conn.execute(INSERT, params![row[0], row[1], row[2], row[3], row[4]])
        })
        .await?;
        Ok(id)
    }

    async fn query(&self, plan: &QueryPlan) -> StashResult<Vec<Record>> {
        let sql = plan.to_sql();
        let raw: Vec<RawRow> = self
            .with_conn(StashError::Query, move |conn| {
                let mut stmt = conn.prepare(&sql.text)?;
                let rows = stmt.query_map(params_from_iter(sql.params.iter().map(to_value)), |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?;
                rows.collect()
            })
            .await?;

        into_records(raw)
    }

    async fn delete(&self, namespace: Option<&str>) -> StashResult<u64> {
        let namespace = namespace.map(str::to_owned);
        let deleted = self
            .with_conn(StashError::Delete, move |conn| match namespace {
                Some(ns) => conn.execute(DELETE_NAMESPACE, params![ns]),
                None => conn.execute(DELETE_ALL, []),
            })
            .await?;
        Ok(u64::try_from(deleted).unwrap_or(u64::MAX))
    }

    async fn close(&self) -> StashResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.permits.close();
        let drained = {
            let mut idle = self
                .idle
                .lock()
                .map_err(|e| StashError::Connection(e.to_string()))?;
            std::mem::take(&mut *idle)
        };
        debug!(idle = drained.len(), "closing sqlite pool");
        drop(drained);
        Ok(())
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

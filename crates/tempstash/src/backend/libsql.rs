//! Remote libSQL backend over HTTP.
//!
//! Connections are cheap handles onto one remote database. A semaphore caps
//! the number of statements in flight and up to `max_idle` handles are kept
//! for reuse until they reach `max_lifetime`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use libsql::params::Params;
use libsql::{Builder, Connection, Database, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info};
use uuid::Uuid;

use super::schema::{CREATE_TABLE, DELETE_ALL, DELETE_NAMESPACE, INSERT, RawRow, into_records};
use super::{Backend, redact};
use crate::config::PoolConfig;
use crate::error::{StashError, StashResult};
use crate::query::{QueryPlan, SqlParam};
use crate::record::{NewRecord, Record};

/// Pooled libSQL backend.
pub struct LibsqlBackend {
    endpoint: String,
    db: Database,
    config: PoolConfig,
    permits: Semaphore,
    idle: Mutex<Vec<PooledConnection>>,
    closed: AtomicBool,
}

struct PooledConnection {
    conn: Connection,
    opened: Instant,
}

/// Split `url` into the HTTP endpoint and the `authToken` query parameter.
///
/// `libsql://` is served over TLS, so it maps to `https://`. Other query
/// parameters are ignored.
pub(crate) fn split_url(url: &str) -> StashResult<(String, String)> {
    let (base, query) = url.split_once('?').unwrap_or((url, ""));
    let endpoint = if let Some(host) = base.strip_prefix("libsql://") {
        format!("https://{host}")
    } else if base.starts_with("https://") || base.starts_with("http://") {
        base.to_string()
    } else {
        return Err(StashError::Connection(format!(
            "not a libsql url: {}",
            redact(url)
        )));
    };

    let token = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "authToken")
        .map(|(_, value)| value.to_string())
        .unwrap_or_default();

    Ok((endpoint, token))
}

impl LibsqlBackend {
    /// Open the remote database named by `url` and ping it.
    ///
    /// # Errors
    ///
    /// Returns [`StashError::Connection`] if the URL is malformed, the client
    /// cannot be built, or the ping does not answer within
    /// `config.connect_timeout_secs`.
    pub async fn connect(url: &str, config: PoolConfig) -> StashResult<Self> {
        let (endpoint, token) = split_url(url)?;
        let db = Builder::new_remote(endpoint.clone(), token)
            .build()
            .await
            .map_err(|e| StashError::Connection(e.to_string()))?;

        let backend = Self {
            endpoint,
            db,
            permits: Semaphore::new(config.max_open.max(1)),
            config,
            idle: Mutex::new(Vec::new()),
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

        info!(endpoint = %backend.endpoint, max_open = backend.config.max_open, "libsql backend connected");
        Ok(backend)
    }

    /// Borrow a pooled connection for the duration of one call.
    async fn with_conn<T, F, Fut>(&self, wrap: fn(String) -> StashError, f: F) -> StashResult<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = libsql::Result<T>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(StashError::Closed);
        }
        let permit = self.permits.acquire().await.map_err(|_| StashError::Closed)?;

        let pooled = match self.take_idle()? {
            Some(pooled) => pooled,
            None => PooledConnection {
                conn: self.db.connect().map_err(|e| wrap(e.to_string()))?,
                opened: Instant::now(),
            },
        };
        let result = f(pooled.conn.clone()).await;
        self.release(pooled);
        drop(permit);
        result.map_err(|e| wrap(e.to_string()))
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
            debug!("dropping expired libsql connection");
        }
        Ok(None)
    }

    fn release(&self, pooled: PooledConnection) {
        if self.permits.is_closed() || pooled.opened.elapsed() >= self.config.max_lifetime() {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.config.max_idle {
                idle.push(pooled);
            }
        }
    }
}

fn to_value(param: &SqlParam) -> Value {
    match param {
        SqlParam::Text(s) => Value::Text(s.clone()),
        SqlParam::Integer(n) => Value::Integer(*n),
    }
}

#[async_trait]
impl Backend for LibsqlBackend {
    async fn ping(&self) -> StashResult<()> {
        self.with_conn(StashError::Connection, |conn| async move {
            let mut rows = conn.query("SELECT 1", ()).await?;
            rows.next().await.map(|_| ())
        })
        .await
    }

    async fn ensure_schema(&self) -> StashResult<()> {
        self.with_conn(StashError::Schema, |conn| async move {
            conn.execute_batch(CREATE_TABLE).await.map(|_| ())
        })
        .await
    }

    async fn insert(&self, record: NewRecord<'_>) -> StashResult<String> {
        let id = Uuid::new_v4().to_string();
        let row = Params::Positional(vec![
            Value::Text(id.clone()),
            Value::Text(record.namespace.to_owned()),
            Value::Text(record.name.to_owned()),
            Value::Text(record.key.to_owned()),
            Value::Text(record.data.to_owned()),
        ]);
        self.with_conn(StashError::Insert, |conn| async move {
            conn.execute(INSERT, row).await
        })
        .await?;
        Ok(id)
    }

    async fn query(&self, plan: &QueryPlan) -> StashResult<Vec<Record>> {
        let sql = plan.to_sql();
        let params = Params::Positional(sql.params.iter().map(to_value).collect());
        let raw: Vec<RawRow> = self
            .with_conn(StashError::Query, |conn| async move {
                let mut rows = conn.query(&sql.text, params).await?;
                let mut raw = Vec::new();
                while let Some(row) = rows.next().await? {
                    raw.push((
                        row.get::<String>(0)?,
                        row.get::<String>(1)?,
                        row.get::<String>(2)?,
                        row.get::<String>(3)?,
                        row.get::<String>(4)?,
                        row.get::<String>(5)?,
                    ));
                }
                Ok(raw)
            })
            .await?;

        into_records(raw)
    }

    async fn delete(&self, namespace: Option<&str>) -> StashResult<u64> {
        let namespace = namespace.map(str::to_owned);
        self.with_conn(StashError::Delete, |conn| async move {
            match namespace {
                Some(ns) => {
                    conn.execute(DELETE_NAMESPACE, Params::Positional(vec![Value::Text(ns)]))
                        .await
                },
                None => conn.execute(DELETE_ALL, ()).await,
            }
        })
        .await
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
        debug!(idle = drained.len(), "closing libsql pool");
        drop(drained);
        Ok(())
    }
}

impl std::fmt::Debug for LibsqlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibsqlBackend")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//! The public facade.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::{Dispatch, debug, warn};

use crate::backend::{self, Backend, redact};
use crate::config::StashConfig;
use crate::context::Context;
use crate::dispatch::{Dispatcher, JobLabel};
use crate::error::{StashError, StashResult};
use crate::query::{QueryFilter, compile};
use crate::record::{NewRecord, Record, StashedItem, marshal};
use crate::retry::{RetryOutcome, RetryPolicy, retry_if};

/// Options applied when a [`Stash`] is created.
#[derive(Debug, Default)]
pub struct StashBuilder {
    config: StashConfig,
    logger: Option<Dispatch>,
}

impl StashBuilder {
    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: StashConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the write retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Route the stash's log events to `logger` instead of the default
    /// dispatcher captured at construction.
    #[must_use]
    pub fn logger(mut self, logger: impl Into<Dispatch>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    /// Connect to the backend named by `url`, ensure the schema, and start
    /// the async write workers.
    ///
    /// # Errors
    ///
    /// [`StashError::Config`] for invalid options, [`StashError::Connection`]
    /// if the backend is unreachable, [`StashError::Schema`] if the relation
    /// cannot be created.
    pub async fn connect(self, url: &str) -> StashResult<Stash> {
        self.config.validate()?;
        let logger = self.resolve_logger();
        let pool = self.config.pool.clone();
        let backend = backend::connect(url, &pool)
            .with_subscriber(logger.clone())
            .await?;
        debug!(url = redact(url), "backend connected");
        self.open(backend).await
    }

    /// Use an already-connected backend.
    ///
    /// # Errors
    ///
    /// [`StashError::Config`] for invalid options, [`StashError::Schema`] if
    /// the relation cannot be created. The backend is closed on failure.
    pub async fn open(self, backend: Arc<dyn Backend>) -> StashResult<Stash> {
        self.config.validate()?;
        let logger = self.resolve_logger();

        let timeout = self.config.schema_timeout();
        let schema = match tokio::time::timeout(timeout, backend.ensure_schema()).await {
            Ok(result) => result,
            Err(_) => Err(StashError::Schema(format!(
                "timed out after {}s",
                timeout.as_secs()
            ))),
        };
        if let Err(e) = schema {
            let _ = backend.close().await;
            return Err(match e {
                StashError::Schema(_) => e,
                other => StashError::Schema(other.to_string()),
            });
        }

        let dispatcher = Dispatcher::start(&self.config.dispatch, logger.clone());
        Ok(Stash {
            backend,
            dispatcher,
            retry: self.config.retry,
            logger,
            closed: AtomicBool::new(false),
        })
    }

    fn resolve_logger(&self) -> Dispatch {
        self.logger
            .clone()
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone))
    }
}

/// Namespaced scratch storage.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Stash {
    backend: Arc<dyn Backend>,
    dispatcher: Dispatcher,
    retry: RetryPolicy,
    logger: Dispatch,
    closed: AtomicBool,
}

impl Stash {
    /// Connect to `url` with default options.
    ///
    /// # Errors
    ///
    /// See [`StashBuilder::connect`].
    pub async fn new(url: &str) -> StashResult<Self> {
        Self::builder().connect(url).await
    }

    /// Start configuring a stash.
    #[must_use]
    pub fn builder() -> StashBuilder {
        StashBuilder::default()
    }

    /// The write retry policy in effect.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fire-and-forget write.
    ///
    /// Returns immediately. Encoding and insertion happen on a worker; any
    /// failure, including a panic, is logged and the item is lost. Use
    /// [`Stash::put_sync`] when delivery must be confirmed.
    pub fn put(&self, ctx: &Context, item: StashedItem) {
        let label = JobLabel {
            namespace: item.namespace.clone(),
            name: item.name.clone(),
            key: item.key.clone(),
        };
        let ctx = ctx.clone();
        let backend = Arc::clone(&self.backend);
        let policy = self.retry.clone();

        self.dispatcher.submit(label, async move {
            insert_with_retry(&ctx, backend.as_ref(), &policy, &item).await?;
            Ok(())
        });
    }

    /// Write and wait for the generated record ID.
    ///
    /// # Errors
    ///
    /// [`StashError::Serialization`] if the payload cannot be encoded (nothing
    /// is inserted), [`StashError::RetryExhausted`] when every attempt fails,
    /// or the most recent attempt's error if `ctx` finishes during a backoff.
    /// [`StashError::Closed`] is returned at once, never retried.
    pub async fn put_sync(&self, ctx: &Context, item: StashedItem) -> StashResult<String> {
        self.check_open()?;
        self.scoped(insert_with_retry(ctx, self.backend.as_ref(), &self.retry, &item))
            .await
    }

    /// Read records matching `filter`, newest first.
    ///
    /// Exactly one backend call; failures are not retried.
    ///
    /// # Errors
    ///
    /// [`StashError::Query`] on backend failure, [`StashError::Cancelled`] if
    /// `ctx` finishes first.
    pub async fn query(&self, ctx: &Context, filter: &QueryFilter) -> StashResult<Vec<Record>> {
        self.check_open()?;
        let plan = compile(filter);
        self.scoped(async {
            let records = ctx.run(self.backend.query(&plan)).await?;
            debug!(
                rows = records.len(),
                limit = plan.limit(),
                predicates = plan.predicates().len(),
                "query complete"
            );
            Ok(records)
        })
        .await
    }

    /// Delete every record in `namespace`, or the whole store when `None`.
    ///
    /// Exactly one backend call; failures are not retried. Returns the number
    /// of records removed.
    ///
    /// # Errors
    ///
    /// [`StashError::Delete`] on backend failure, [`StashError::Cancelled`] if
    /// `ctx` finishes first.
    pub async fn clear(&self, ctx: &Context, namespace: Option<&str>) -> StashResult<u64> {
        self.check_open()?;
        self.scoped(async {
            let removed = ctx.run(self.backend.delete(namespace)).await?;
            debug!(namespace = ?namespace, removed, "records dropped");
            Ok(removed)
        })
        .await
    }

    /// Drain queued async writes and release the backend.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Propagates the backend's error from releasing its handle.
    pub async fn close(&self) -> StashResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.scoped(async {
            self.dispatcher.shutdown().await;
            self.backend.close().await?;
            debug!("stash closed");
            Ok(())
        })
        .await
    }

    fn check_open(&self) -> StashResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StashError::Closed)
        } else {
            Ok(())
        }
    }

    fn scoped<F: Future>(&self, fut: F) -> WithDispatch<F> {
        fut.with_subscriber(self.logger.clone())
    }
}

impl std::fmt::Debug for Stash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stash")
            .field("retry", &self.retry)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Encode `item` and insert it under `policy`.
async fn insert_with_retry(
    ctx: &Context,
    backend: &dyn Backend,
    policy: &RetryPolicy,
    item: &StashedItem,
) -> StashResult<String> {
    let data = marshal(&item.data)?;
    let record = NewRecord {
        namespace: &item.namespace,
        name: &item.name,
        key: &item.key,
        data: &data,
    };

    let outcome = retry_if(
        ctx,
        policy,
        |attempt| async move {
            let result = ctx.run(backend.insert(record)).await;
            if let Err(e) = &result {
                warn!(attempt, namespace = %record.namespace, error = %e, "insert attempt failed");
            }
            result
        },
        StashError::is_retryable,
    )
    .await;

    match outcome {
        RetryOutcome::Success(id) => {
            debug!(id = %id, namespace = %item.namespace, key = %item.key, "record stored");
            Ok(id)
        },
        RetryOutcome::Exhausted { error, attempts } => Err(StashError::RetryExhausted {
            attempts,
            source: Box::new(error),
        }),
        RetryOutcome::Interrupted { error, .. } | RetryOutcome::Aborted { error, .. } => Err(error),
    }
}

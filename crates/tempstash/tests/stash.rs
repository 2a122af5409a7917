//! End-to-end tests for the stash facade.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Serialize, Serializer};
use tempfile::TempDir;
use tempstash::query::QueryPlan;
use tempstash::record::NewRecord;
use tempstash::{
    Backend, Context, Data, MemoryBackend, QueryFilter, Record, RetryPolicy, Stash, StashError,
    StashResult, StashedItem,
};

/// Wraps a [`MemoryBackend`], failing the first `failures` inserts and,
/// when `fail_reads` is set, every query and delete.
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    failures: AtomicU32,
    insert_calls: AtomicU32,
    query_calls: AtomicU32,
    delete_calls: AtomicU32,
    fail_reads: bool,
    fail_schema: bool,
    closed: AtomicBool,
}

impl FlakyBackend {
    fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    fn calls(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn ping(&self) -> StashResult<()> {
        self.inner.ping().await
    }

    async fn ensure_schema(&self) -> StashResult<()> {
        if self.fail_schema {
            return Err(StashError::Schema("read-only database".into()));
        }
        self.inner.ensure_schema().await
    }

    async fn insert(&self, record: NewRecord<'_>) -> StashResult<String> {
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StashError::Insert(format!("transient failure #{call}")));
        }
        self.inner.insert(record).await
    }

    async fn query(&self, plan: &QueryPlan) -> StashResult<Vec<Record>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads {
            return Err(StashError::Query("replica unavailable".into()));
        }
        self.inner.query(plan).await
    }

    async fn delete(&self, namespace: Option<&str>) -> StashResult<u64> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads {
            return Err(StashError::Delete("table locked".into()));
        }
        self.inner.delete(namespace).await
    }

    async fn close(&self) -> StashResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.inner.close().await
    }
}

struct Unencodable;

impl Serialize for Unencodable {
    fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("refusing to encode"))
    }
}

struct Explosive;

impl Serialize for Explosive {
    fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
        panic!("serializer blew up")
    }
}

#[derive(Serialize)]
struct Upper {
    #[serde(rename = "A")]
    a: i32,
}

/// Log sink shared between a test and the stash under test.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

async fn memory_stash() -> (Stash, Arc<FlakyBackend>) {
    let backend = Arc::new(FlakyBackend::default());
    let stash = Stash::builder()
        .retry(fast_policy())
        .open(backend.clone())
        .await
        .unwrap();
    (stash, backend)
}

async fn sqlite_stash(dir: &TempDir) -> Stash {
    let url = format!("sqlite://{}", dir.path().join("stash.db").display());
    Stash::builder()
        .retry(fast_policy())
        .connect(&url)
        .await
        .unwrap()
}

/// Text, bytes and structured payloads are stored in their marshalled form.
#[tokio::test]
async fn test_put_sync_stores_marshalled_payloads() {
    let (stash, _) = memory_stash().await;
    let ctx = Context::background();

    stash
        .put_sync(&ctx, StashedItem::new("ns", "hello").with_key("text"))
        .await
        .unwrap();
    stash
        .put_sync(&ctx, StashedItem::new("ns", b"bytes".to_vec()).with_key("bytes"))
        .await
        .unwrap();
    stash
        .put_sync(&ctx, StashedItem::new("ns", Data::json(Upper { a: 1 })).with_key("json"))
        .await
        .unwrap();

    for (key, expected) in [("text", "hello"), ("bytes", "bytes"), ("json", r#"{"A":1}"#)] {
        let rows = stash
            .query(&ctx, &QueryFilter::new().namespace("ns").key(key))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1, "key {key}");
        assert_eq!(rows[0].data, expected);
    }
}

/// A payload that cannot be encoded is rejected before any insert.
#[tokio::test]
async fn test_put_sync_serialization_failure_inserts_nothing() {
    let (stash, backend) = memory_stash().await;
    let ctx = Context::background();

    let err = stash
        .put_sync(&ctx, StashedItem::new("ns", Data::json(Unencodable)))
        .await
        .unwrap_err();

    assert!(matches!(err, StashError::Serialization(_)));
    assert_eq!(backend.calls(), 0);
    assert!(stash.query(&ctx, &QueryFilter::new()).await.unwrap().is_empty());
}

/// Transient insert failures are retried until one succeeds.
#[tokio::test]
async fn test_put_sync_recovers_from_transient_failures() {
    let backend = Arc::new(FlakyBackend::failing(2));
    let stash = Stash::builder()
        .retry(fast_policy())
        .open(backend.clone())
        .await
        .unwrap();

    let id = stash
        .put_sync(&Context::background(), StashedItem::new("ns", "v"))
        .await
        .unwrap();

    assert_eq!(backend.calls(), 3);
    let rows = stash
        .query(&Context::background(), &QueryFilter::new())
        .await
        .unwrap();
    assert_eq!(rows[0].id, id);
}

/// When every attempt fails the caller gets the last failure wrapped.
#[tokio::test]
async fn test_put_sync_retry_exhausted() {
    let backend = Arc::new(FlakyBackend::failing(u32::MAX));
    let stash = Stash::builder()
        .retry(fast_policy())
        .open(backend.clone())
        .await
        .unwrap();

    let err = stash
        .put_sync(&Context::background(), StashedItem::new("ns", "v"))
        .await
        .unwrap_err();

    assert_eq!(backend.calls(), 3);
    match err {
        StashError::RetryExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, StashError::Insert(ref m) if m == "transient failure #3"));
        },
        other => panic!("unexpected error: {other}"),
    }
}

/// Cancelling during a backoff returns the last insert failure, not a cancellation.
#[tokio::test(start_paused = true)]
async fn test_put_sync_cancelled_during_backoff() {
    let backend = Arc::new(FlakyBackend::failing(u32::MAX));
    let stash = Stash::builder()
        .retry(RetryPolicy::new(5, Duration::from_secs(30)))
        .open(backend.clone())
        .await
        .unwrap();

    let ctx = Context::background();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = stash
        .put_sync(&ctx, StashedItem::new("ns", "v"))
        .await
        .unwrap_err();

    assert!(matches!(err, StashError::Insert(ref m) if m == "transient failure #1"));
    assert_eq!(backend.calls(), 1);
}

/// Concurrent synchronous writes each get a distinct ID.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_put_sync_ids_are_unique() {
    let (stash, _) = memory_stash().await;
    let stash = Arc::new(stash);

    let mut handles = Vec::new();
    for i in 0..50 {
        let stash = Arc::clone(&stash);
        handles.push(tokio::spawn(async move {
            stash
                .put_sync(&Context::background(), StashedItem::new("ns", i.to_string()))
                .await
                .unwrap()
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        assert!(ids.insert(handle.await.unwrap()));
    }
    assert_eq!(ids.len(), 50);
}

/// Fire-and-forget writes land once the queue drains.
#[tokio::test]
async fn test_put_is_stored_after_close_drains() {
    let backend = Arc::new(FlakyBackend::failing(1));
    let stash = Stash::builder()
        .retry(fast_policy())
        .open(backend.clone())
        .await
        .unwrap();

    for i in 0..10 {
        stash.put(
            &Context::background(),
            StashedItem::new("async", format!("payload {i}")).with_key(i.to_string()),
        );
    }
    stash.close().await.unwrap();

    // One transient failure was retried; every write arrived.
    assert_eq!(backend.calls(), 11);
    assert_eq!(backend.inner.len().unwrap(), 10);
}

/// An unencodable async payload is logged and dropped; the caller sees nothing.
#[tokio::test]
async fn test_put_serialization_failure_is_logged_not_raised() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();

    let backend = Arc::new(FlakyBackend::default());
    let stash = Stash::builder()
        .retry(fast_policy())
        .logger(subscriber)
        .open(backend.clone())
        .await
        .unwrap();

    stash.put(
        &Context::background(),
        StashedItem::new("ns", Data::json(Unencodable)).with_key("bad"),
    );
    // put returned without waiting on the worker.
    stash.close().await.unwrap();

    assert_eq!(backend.calls(), 0);
    let out = logs.contents();
    assert!(out.contains("async put failed"), "logs: {out}");
    assert!(out.contains("refusing to encode"), "logs: {out}");
}

/// A panic inside an async write is contained and later writes still work.
#[tokio::test]
async fn test_put_panic_is_contained() {
    let (stash, backend) = memory_stash().await;
    let ctx = Context::background();

    stash.put(&ctx, StashedItem::new("ns", Data::json(Explosive)));
    stash.put(&ctx, StashedItem::new("ns", "survivor"));

    let id = stash
        .put_sync(&ctx, StashedItem::new("ns", "sync after panic"))
        .await
        .unwrap();
    assert!(!id.is_empty());

    stash.close().await.unwrap();
    assert_eq!(backend.inner.len().unwrap(), 2);
}

/// Puts after close are dropped without error.
#[tokio::test]
async fn test_put_after_close_is_dropped() {
    let (stash, backend) = memory_stash().await;
    stash.close().await.unwrap();
    stash.put(&Context::background(), StashedItem::new("ns", "late"));
    assert_eq!(backend.calls(), 0);
}

/// An empty filter returns the newest 100 records across namespaces.
#[tokio::test]
async fn test_query_empty_filter_defaults() {
    let (stash, _) = memory_stash().await;
    let ctx = Context::background();
    for i in 0..120 {
        let ns = if i % 2 == 0 { "even" } else { "odd" };
        stash
            .put_sync(&ctx, StashedItem::new(ns, i.to_string()))
            .await
            .unwrap();
    }

    let rows = stash.query(&ctx, &QueryFilter::new()).await.unwrap();
    assert_eq!(rows.len(), 100);
    assert_eq!(rows[0].data, "119");
    assert!(rows.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    let namespaces: HashSet<_> = rows.iter().map(|r| r.namespace.as_str()).collect();
    assert_eq!(namespaces.len(), 2);

    let zero = stash
        .query(&ctx, &QueryFilter::new().limit(0))
        .await
        .unwrap();
    let hundred = stash
        .query(&ctx, &QueryFilter::new().limit(100))
        .await
        .unwrap();
    assert_eq!(zero, hundred);

    let five = stash
        .query(&ctx, &QueryFilter::new().limit(5))
        .await
        .unwrap();
    assert_eq!(five.len(), 5);
}

/// `since` is an inclusive lower bound.
#[tokio::test]
async fn test_query_since_is_inclusive_lower_bound() {
    let (stash, _) = memory_stash().await;
    let ctx = Context::background();

    stash.put_sync(&ctx, StashedItem::new("ns", "old")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stash.put_sync(&ctx, StashedItem::new("ns", "new")).await.unwrap();

    let all = stash.query(&ctx, &QueryFilter::new()).await.unwrap();
    let cutoff = all[0].created_at;

    let rows = stash
        .query(&ctx, &QueryFilter::new().since(cutoff))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].data, "new");
    assert!(rows.iter().all(|r| r.created_at >= cutoff));
}

/// Clearing one namespace leaves others; clearing everything empties the store.
#[tokio::test]
async fn test_clear_scoped_then_global() {
    let (stash, _) = memory_stash().await;
    let ctx = Context::background();
    for ns in ["ns1", "ns1", "ns2", "ns3"] {
        stash.put_sync(&ctx, StashedItem::new(ns, "v")).await.unwrap();
    }

    assert_eq!(stash.clear(&ctx, Some("ns1")).await.unwrap(), 2);
    let rows = stash.query(&ctx, &QueryFilter::new()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.namespace != "ns1"));

    stash.clear(&ctx, None).await.unwrap();
    assert!(stash.query(&ctx, &QueryFilter::new()).await.unwrap().is_empty());
}

/// A done context short-circuits reads.
#[tokio::test]
async fn test_query_honors_cancellation() {
    let (stash, _) = memory_stash().await;
    let ctx = Context::background();
    ctx.cancel();
    assert!(matches!(
        stash.query(&ctx, &QueryFilter::new()).await,
        Err(StashError::Cancelled)
    ));
}

/// Reads and deletes make one backend call and surface its error unwrapped.
#[tokio::test]
async fn test_query_and_clear_are_not_retried() {
    let backend = Arc::new(FlakyBackend {
        fail_reads: true,
        ..FlakyBackend::default()
    });
    let stash = Stash::builder()
        .retry(fast_policy())
        .open(backend.clone())
        .await
        .unwrap();
    let ctx = Context::background();

    let err = stash.query(&ctx, &QueryFilter::new()).await.unwrap_err();
    assert!(matches!(err, StashError::Query(ref m) if m == "replica unavailable"));
    assert_eq!(backend.query_calls.load(Ordering::SeqCst), 1);

    let err = stash.clear(&ctx, Some("ns")).await.unwrap_err();
    assert!(matches!(err, StashError::Delete(ref m) if m == "table locked"));
    let err = stash.clear(&ctx, None).await.unwrap_err();
    assert!(matches!(err, StashError::Delete(_)));
    assert_eq!(backend.delete_calls.load(Ordering::SeqCst), 2);
}

/// Operations on a closed stash fail at once without touching the backend.
#[tokio::test]
async fn test_closed_stash_fails_fast() {
    let (stash, backend) = memory_stash().await;
    stash.close().await.unwrap();
    let ctx = Context::background();

    assert!(matches!(
        stash.put_sync(&ctx, StashedItem::new("ns", "late")).await,
        Err(StashError::Closed)
    ));
    assert!(matches!(stash.clear(&ctx, None).await, Err(StashError::Closed)));
    assert_eq!(backend.calls(), 0);
    assert_eq!(backend.query_calls.load(Ordering::SeqCst), 0);
    assert_eq!(backend.delete_calls.load(Ordering::SeqCst), 0);
}

/// A backend released underneath the stash is not retried with backoff.
#[tokio::test(start_paused = true)]
async fn test_put_sync_does_not_retry_closed_backend() {
    let backend = Arc::new(FlakyBackend::default());
    let stash = Stash::builder()
        .retry(RetryPolicy::new(3, Duration::from_millis(500)))
        .open(backend.clone())
        .await
        .unwrap();
    backend.inner.close().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = stash
        .put_sync(&Context::background(), StashedItem::new("ns", "v"))
        .await
        .unwrap_err();

    assert!(matches!(err, StashError::Closed));
    assert_eq!(backend.calls(), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

/// Close is idempotent and releases the backend.
#[tokio::test]
async fn test_close_is_idempotent() {
    let (stash, backend) = memory_stash().await;
    stash.close().await.unwrap();
    stash.close().await.unwrap();
    assert!(backend.closed.load(Ordering::SeqCst));
    assert!(matches!(
        stash.query(&Context::background(), &QueryFilter::new()).await,
        Err(StashError::Closed)
    ));
}

/// Schema failures fail construction and release the backend.
#[tokio::test]
async fn test_schema_failure_is_fatal() {
    let backend = Arc::new(FlakyBackend {
        fail_schema: true,
        ..FlakyBackend::default()
    });
    let err = Stash::builder().open(backend.clone()).await.unwrap_err();
    assert!(matches!(err, StashError::Schema(_)));
    assert!(backend.closed.load(Ordering::SeqCst));
}

/// Unknown URLs are connection errors.
#[tokio::test]
async fn test_unknown_url_is_connection_error() {
    let err = Stash::new("postgres://localhost/db").await.unwrap_err();
    assert!(matches!(err, StashError::Connection(_)));
}

/// The full lifecycle against an on-disk SQLite database.
#[tokio::test]
async fn test_sqlite_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let stash = sqlite_stash(&dir).await;
    let ctx = Context::with_timeout(Duration::from_secs(30));

    let start = chrono::Utc::now() - chrono::TimeDelta::seconds(1);
    let id = stash
        .put_sync(
            &ctx,
            StashedItem::new("examples", "fn main() {}")
                .with_name("self-stash")
                .with_key("main.rs"),
        )
        .await
        .unwrap();
    stash.put(&ctx, StashedItem::new("other", Data::json(serde_json::json!({"n": 1}))));

    let rows = stash
        .query(&ctx, &QueryFilter::new().namespace("examples").since(start))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].name, "self-stash");
    assert_eq!(rows[0].key, "main.rs");
    assert_eq!(rows[0].data, "fn main() {}");

    assert_eq!(stash.clear(&ctx, Some("examples")).await.unwrap(), 1);
    stash.close().await.unwrap();

    // Reopen: the async write was drained before close.
    let stash = sqlite_stash(&dir).await;
    let rows = stash.query(&ctx, &QueryFilter::new()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].namespace, "other");
    assert_eq!(rows[0].data, r#"{"n":1}"#);

    stash.clear(&ctx, None).await.unwrap();
    assert!(stash.query(&ctx, &QueryFilter::new()).await.unwrap().is_empty());
    stash.close().await.unwrap();
}

/// On SQLite a record's own timestamp is an inclusive bound, and bounds past
/// year 9999 match nothing on either backend.
#[tokio::test]
async fn test_since_bounds_agree_across_backends() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = sqlite_stash(&dir).await;
    let (memory, _) = memory_stash().await;
    let ctx = Context::background();

    for stash in [&sqlite, &memory] {
        stash.put_sync(&ctx, StashedItem::new("ns", "old")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stash.put_sync(&ctx, StashedItem::new("ns", "new")).await.unwrap();

        let all = stash.query(&ctx, &QueryFilter::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        let cutoff = all[0].created_at;

        let rows = stash
            .query(&ctx, &QueryFilter::new().since(cutoff))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, "new");
        assert_eq!(rows[0].created_at, cutoff);

        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        let rows = stash
            .query(&ctx, &QueryFilter::new().since(far))
            .await
            .unwrap();
        assert!(rows.is_empty());

        let ancient = Utc.with_ymd_and_hms(-5, 1, 1, 0, 0, 0).unwrap();
        let rows = stash
            .query(&ctx, &QueryFilter::new().since(ancient))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    sqlite.close().await.unwrap();
    memory.close().await.unwrap();
}

/// Concurrent writes through the SQLite pool all succeed with unique IDs.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_concurrent_put_sync() {
    let dir = tempfile::tempdir().unwrap();
    let stash = Arc::new(sqlite_stash(&dir).await);

    let mut handles = Vec::new();
    for i in 0..25 {
        let stash = Arc::clone(&stash);
        handles.push(tokio::spawn(async move {
            stash
                .put_sync(&Context::background(), StashedItem::new("ns", i.to_string()))
                .await
                .unwrap()
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        assert!(ids.insert(handle.await.unwrap()));
    }

    let rows = stash
        .query(&Context::background(), &QueryFilter::new().namespace("ns"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 25);
    stash.close().await.unwrap();
}

//! In-process backend for tests and ephemeral data.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use uuid::Uuid;

use super::Backend;
use crate::error::{StashError, StashResult};
use crate::query::{QueryPlan, SortOrder};
use crate::record::{NewRecord, Record};

/// In-memory backend.
///
/// Records live in insertion order in a `Vec`; `created_at` is truncated to
/// milliseconds to match the on-disk backends.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    rows: RwLock<Vec<Record>>,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    ///
    /// # Errors
    ///
    /// Returns [`StashError::Query`] if the lock is poisoned.
    pub fn len(&self) -> StashResult<usize> {
        Ok(self
            .rows
            .read()
            .map_err(|e| StashError::Query(e.to_string()))?
            .len())
    }

    /// Whether the backend holds no records.
    ///
    /// # Errors
    ///
    /// Returns [`StashError::Query`] if the lock is poisoned.
    pub fn is_empty(&self) -> StashResult<bool> {
        self.len().map(|n| n == 0)
    }

    fn check_open(&self) -> StashResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StashError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> StashResult<()> {
        self.check_open()
    }

    async fn ensure_schema(&self) -> StashResult<()> {
        self.check_open()
    }

    async fn insert(&self, record: NewRecord<'_>) -> StashResult<String> {
        self.check_open()?;
        let id = Uuid::new_v4().to_string();
        let row = Record {
            id: id.clone(),
            namespace: record.namespace.to_owned(),
            name: record.name.to_owned(),
            key: record.key.to_owned(),
            data: record.data.to_owned(),
            created_at: Utc::now().trunc_subsecs(3),
        };
        self.rows
            .write()
            .map_err(|e| StashError::Insert(e.to_string()))?
            .push(row);
        Ok(id)
    }

    async fn query(&self, plan: &QueryPlan) -> StashResult<Vec<Record>> {
        self.check_open()?;
        let rows = self
            .rows
            .read()
            .map_err(|e| StashError::Query(e.to_string()))?;

        // Newest insert first, so equal timestamps come back newest-inserted first.
        let mut out: Vec<Record> = rows
            .iter()
            .rev()
            .filter(|r| plan.matches(r))
            .cloned()
            .collect();
        match plan.order() {
            SortOrder::CreatedAtDesc => out.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        }
        out.truncate(plan.limit());
        Ok(out)
    }

    async fn delete(&self, namespace: Option<&str>) -> StashResult<u64> {
        self.check_open()?;
        let mut rows = self
            .rows
            .write()
            .map_err(|e| StashError::Delete(e.to_string()))?;
        let before = rows.len();
        match namespace {
            Some(ns) => rows.retain(|r| r.namespace != ns),
            None => rows.clear(),
        }
        Ok(u64::try_from(before.saturating_sub(rows.len())).unwrap_or(u64::MAX))
    }

    async fn close(&self) -> StashResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

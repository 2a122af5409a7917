//! Filter-to-query compiler.
//!
//! [`compile`] turns a sparse [`QueryFilter`] into a [`QueryPlan`]: the
//! predicates to apply, the sort order, and a row limit. Compilation does
//! no I/O. Backends either render the plan to SQL with
//! [`QueryPlan::to_sql`] or evaluate it directly with [`QueryPlan::matches`].

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Record, ceil_to_millis, format_timestamp};

/// Row limit applied when the filter does not set a positive one.
pub const DEFAULT_LIMIT: usize = 100;

/// Sparse query filter. `None` means "no constraint on that dimension".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilter {
    /// Exact namespace match.
    pub namespace: Option<String>,
    /// Exact key match.
    pub key: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<DateTime<Utc>>,
    /// Maximum rows; `None` or zero means [`DEFAULT_LIMIT`].
    pub limit: Option<usize>,
}

impl QueryFilter {
    /// An empty filter: the newest [`DEFAULT_LIMIT`] records of the whole store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restrict to one key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Only records created at or after `since`.
    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Cap the number of rows.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One conjunct of a plan's `WHERE` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// `namespace = ?`
    Namespace(String),
    /// `key = ?`
    Key(String),
    /// `created_at >= ?`
    CreatedSince(DateTime<Utc>),
}

impl Predicate {
    /// Whether `record` satisfies this predicate.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Namespace(ns) => record.namespace == *ns,
            Self::Key(key) => record.key == *key,
            Self::CreatedSince(since) => record.created_at >= *since,
        }
    }
}

/// Result ordering. Only one order exists: newest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// `ORDER BY created_at DESC`; ties are left to the backend.
    #[default]
    CreatedAtDesc,
}

/// A compiled read plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    predicates: Vec<Predicate>,
    order: SortOrder,
    limit: usize,
}

/// Compile a filter into a deterministic, bounded, ordered plan.
///
/// Predicates are emitted in a fixed order: namespace, key, since.
#[must_use]
pub fn compile(filter: &QueryFilter) -> QueryPlan {
    let mut predicates = Vec::with_capacity(3);

    if let Some(ns) = &filter.namespace {
        predicates.push(Predicate::Namespace(ns.clone()));
    }
    if let Some(key) = &filter.key {
        predicates.push(Predicate::Key(key.clone()));
    }
    if let Some(since) = filter.since {
        predicates.push(Predicate::CreatedSince(since));
    }

    let limit = match filter.limit {
        Some(n) if n > 0 => n,
        _ => DEFAULT_LIMIT,
    };

    QueryPlan {
        predicates,
        order: SortOrder::CreatedAtDesc,
        limit,
    }
}

/// A positional SQL parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    /// Bound as `TEXT`.
    Text(String),
    /// Bound as `INTEGER`.
    Integer(i64),
}

/// Rendered SQL with its parameters in `?N` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlQuery {
    /// Statement text.
    pub text: String,
    /// Parameters for `?1`, `?2`, ...
    pub params: Vec<SqlParam>,
}

/// How a `since` bound renders against the fixed-width text column.
enum SinceBound {
    Text(String),
    /// Earlier than any four-digit year: every row qualifies.
    Unbounded,
    /// Later than any four-digit year: no row qualifies.
    Unsatisfiable,
}

/// Stored timestamps always carry a four-digit year; outside that range
/// chrono adds a sign and text order stops matching time order.
fn since_bound(since: DateTime<Utc>) -> SinceBound {
    let since = ceil_to_millis(since);
    match since.year() {
        y if y < 0 => SinceBound::Unbounded,
        y if y > 9999 => SinceBound::Unsatisfiable,
        _ => SinceBound::Text(format_timestamp(since)),
    }
}

const SELECT_BASE: &str =
    "SELECT id, namespace, name, key, data, created_at FROM stash WHERE 1=1";

impl QueryPlan {
    /// Predicates, all of which must hold.
    #[must_use]
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Result order.
    #[must_use]
    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Maximum number of rows.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether `record` satisfies every predicate.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }

    /// Render against the `stash` relation.
    ///
    /// `since` bounds are written in the stored timestamp format, rounded up
    /// to whole milliseconds so text comparison agrees with time comparison.
    #[must_use]
    pub fn to_sql(&self) -> SqlQuery {
        let mut text = String::from(SELECT_BASE);
        let mut params = Vec::with_capacity(self.predicates.len().saturating_add(1));

        for predicate in &self.predicates {
            let (column, op, param) = match predicate {
                Predicate::Namespace(ns) => ("namespace", "=", SqlParam::Text(ns.clone())),
                Predicate::Key(key) => ("key", "=", SqlParam::Text(key.clone())),
                Predicate::CreatedSince(since) => match since_bound(*since) {
                    SinceBound::Text(bound) => ("created_at", ">=", SqlParam::Text(bound)),
                    SinceBound::Unbounded => continue,
                    SinceBound::Unsatisfiable => {
                        text.push_str(" AND 0");
                        continue;
                    },
                },
            };
            params.push(param);
            text.push_str(&format!(" AND {column} {op} ?{}", params.len()));
        }

        match self.order {
            SortOrder::CreatedAtDesc => text.push_str(" ORDER BY created_at DESC"),
        }

        params.push(SqlParam::Integer(
            i64::try_from(self.limit).unwrap_or(i64::MAX),
        ));
        text.push_str(&format!(" LIMIT ?{}", params.len()));

        SqlQuery { text, params }
    }
}

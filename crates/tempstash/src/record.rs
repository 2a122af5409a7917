//! Items submitted by callers and records read back from the store.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StashError, StashResult};

/// Something a caller wants stashed.
///
/// `data` is encoded to text only when the write actually runs.
#[derive(Debug, Clone)]
pub struct StashedItem {
    /// Logical partition; the unit of bulk deletion.
    pub namespace: String,
    /// Free-form label.
    pub name: String,
    /// Lookup key within the namespace.
    pub key: String,
    /// Payload.
    pub data: Data,
}

impl StashedItem {
    /// Create an item with an empty name and key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, data: impl Into<Data>) -> Self {
        Self {
            namespace: namespace.into(),
            name: String::new(),
            key: String::new(),
            data: data.into(),
        }
    }

    /// Set the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

/// Object-safe view of a serializable value.
trait Encode: Send + Sync {
    fn encode(&self) -> serde_json::Result<String>;
}

impl<T: Serialize + Send + Sync> Encode for T {
    fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Payload of a [`StashedItem`].
#[derive(Clone)]
pub enum Data {
    /// Stored unchanged.
    Text(String),
    /// Stored unchanged; must be valid UTF-8.
    Bytes(Vec<u8>),
    /// Encoded as JSON at write time.
    Structured(Structured),
}

/// A type-erased serializable value held by [`Data::Structured`].
#[derive(Clone)]
pub struct Structured(Arc<dyn Encode>);

impl Data {
    /// Wrap any serializable value; it is encoded as JSON when written.
    pub fn json<T>(value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self::Structured(Structured(Arc::new(value)))
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Structured(_) => f.debug_tuple("Structured").finish_non_exhaustive(),
        }
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<Vec<u8>> for Data {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for Data {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl From<serde_json::Value> for Data {
    fn from(v: serde_json::Value) -> Self {
        Self::json(v)
    }
}

/// Encode a payload to its stored text form.
///
/// Text and bytes pass through unchanged; everything else becomes JSON.
///
/// # Errors
///
/// Returns [`StashError::Serialization`] if the value cannot be encoded or
/// the bytes are not valid UTF-8.
pub fn marshal(data: &Data) -> StashResult<String> {
    match data {
        Data::Text(s) => Ok(s.clone()),
        Data::Bytes(b) => String::from_utf8(b.clone())
            .map_err(|e| StashError::Serialization(format!("payload bytes are not UTF-8: {e}"))),
        Data::Structured(Structured(v)) => Ok(v.encode()?),
    }
}

/// A row about to be inserted.
#[derive(Debug, Clone, Copy)]
pub struct NewRecord<'a> {
    /// Namespace column.
    pub namespace: &'a str,
    /// Name column.
    pub name: &'a str,
    /// Key column.
    pub key: &'a str,
    /// Serialized payload.
    pub data: &'a str,
}

/// An immutable stored item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Globally unique identifier generated at insert time.
    pub id: String,
    /// Namespace the record belongs to.
    pub namespace: String,
    /// Name given by the writer.
    pub name: String,
    /// Key given by the writer.
    pub key: String,
    /// Serialized payload.
    pub data: String,
    /// Insert time on the backend's clock.
    pub created_at: DateTime<Utc>,
}

/// Format a timestamp the way the store writes `created_at`:
/// RFC 3339, UTC, exactly three fractional digits, `Z` suffix.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored `created_at` value.
///
/// # Errors
///
/// Returns [`StashError::Query`] if the text is not RFC 3339.
pub fn parse_timestamp(raw: &str) -> StashResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StashError::Query(format!("invalid created_at {raw:?}: {e}")))
}

/// Round up to the next whole millisecond, the resolution of stored timestamps.
#[must_use]
pub(crate) fn ceil_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = ts.trunc_subsecs(3);
    if truncated == ts {
        ts
    } else {
        truncated
            .checked_add_signed(TimeDelta::milliseconds(1))
            .unwrap_or(truncated)
    }
}

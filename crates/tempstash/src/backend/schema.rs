//! The `stash` relation as seen by the SQL backends.

use crate::error::StashResult;
use crate::record::{Record, parse_timestamp};

/// `created_at` defaults to the server clock in the fixed-width format
/// [`format_timestamp`](crate::record::format_timestamp) writes.
pub(crate) const CREATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS stash (
    id         TEXT PRIMARY KEY,
    namespace  TEXT NOT NULL,
    name       TEXT NOT NULL DEFAULT '',
    key        TEXT NOT NULL DEFAULT '',
    data       TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_stash_namespace ON stash(namespace);
CREATE INDEX IF NOT EXISTS idx_stash_key       ON stash(namespace, key);
";

pub(crate) const INSERT: &str =
    "INSERT INTO stash (id, namespace, name, key, data) VALUES (?1, ?2, ?3, ?4, ?5)";

pub(crate) const DELETE_NAMESPACE: &str = "DELETE FROM stash WHERE namespace = ?1";

pub(crate) const DELETE_ALL: &str = "DELETE FROM stash";

/// Column values in `SELECT` order, before timestamp parsing.
pub(crate) type RawRow = (String, String, String, String, String, String);

pub(crate) fn into_records(rows: Vec<RawRow>) -> StashResult<Vec<Record>> {
    rows.into_iter()
        .map(|(id, namespace, name, key, data, created_at)| {
            Ok(Record {
                id,
                namespace,
                name,
                key,
                data,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .collect()
}

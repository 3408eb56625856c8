//! # Domain Types for pipedb
//!
//! This module defines the core types used throughout pipedb: pipes, records,
//! cursors and error entries.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Pipes, records and cursors are all identified by SQLite integers. Wrapping
//! each in its own single-field struct means a [`RecordId`] can never be
//! passed where a [`PipeId`] is expected, and function signatures say what
//! they operate on.
//!
//! ## Invariants
//!
//! - [`RecordId`]: strictly increasing within one pipe, never reused, and
//!   never renumbered when records are deleted
//! - [`Cursor::offset`]: id of the last source record the target has fully
//!   processed; `RecordId::ZERO` means "nothing consumed"

use std::fmt;
use std::path::PathBuf;

use serde_json::Value;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a pipe in the `pipes` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(i64);

impl PipeId {
    /// Creates a PipeId from a raw database value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for database storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a record in its pipe's log.
///
/// # Why Not Just i64?
///
/// Record ids double as cursor offsets. Keeping them in their own type stops
/// an offset from being confused with a count (e.g. in `seek(n)`, `n` is a
/// number of records, never an id distance).
///
/// # Storage
///
/// Stored as `INTEGER PRIMARY KEY AUTOINCREMENT`, so SQLite never hands out
/// an id twice even after the highest record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RecordId(i64);

impl RecordId {
    /// The position before the first record. A fresh cursor starts here.
    pub const ZERO: RecordId = RecordId(0);

    /// Creates a RecordId from a raw database value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for database storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a row in the `cursors` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(i64);

impl CursorId {
    /// Creates a CursorId from a raw database value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for database storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

// =============================================================================
// Pipe Definition
// =============================================================================

/// A defined pipe: its identity and where its records live.
///
/// `location` is `None` for pipes stored in the main database. External
/// pipes keep their records in a separate SQLite file that is ATTACHed to
/// the main connection under [`PipeDef::schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeDef {
    /// Row id in the `pipes` table
    pub id: PipeId,
    /// Unique pipe name
    pub name: String,
    /// Path of the external store, if any
    pub location: Option<PathBuf>,
}

impl PipeDef {
    /// Schema the record table lives in (`main` or the attach alias).
    pub fn schema(&self) -> String {
        match self.location {
            Some(_) => format!("ext_{}", self.id.as_raw()),
            None => "main".to_string(),
        }
    }

    /// Fully qualified record table name, safe to splice into SQL.
    ///
    /// Both parts are derived from the integer id, never from the user's
    /// pipe name, so no quoting is needed.
    pub fn table(&self) -> String {
        format!("{}.records_{}", self.schema(), self.id.as_raw())
    }

    /// Whether the records live outside the main database.
    pub fn is_external(&self) -> bool {
        self.location.is_some()
    }
}

// =============================================================================
// Records
// =============================================================================

/// Codec tag stored alongside a value blob.
///
/// The tag describes the bytes, not the logical value: a compressed and an
/// uncompressed record with the same value read back identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// zstd frame around the serialized value
    Zstd,
}

impl Compression {
    /// Tag written to the `compression` column.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Compression::Zstd => "zstd",
        }
    }

    /// Parses a tag read from the `compression` column.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

/// A (key, value) pair on its way into a pipe.
///
/// # Rust Pattern: From Conversions
///
/// `append` accepts anything that converts into an `Item`:
///
/// ```rust
/// use pipedb::types::Item;
/// use serde_json::json;
///
/// let key_only: Item = json!("page-1").into();
/// let pair: Item = (json!("page-1"), json!({"title": "Home"})).into();
/// assert!(key_only.value.is_none());
/// assert!(pair.value.is_some());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Record identity, not required to be unique
    pub key: Value,
    /// Payload, may be absent
    pub value: Option<Value>,
}

impl Item {
    /// Creates an item with both key and value.
    pub fn new(key: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Creates an item with no value.
    pub fn key_only(key: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

impl From<Value> for Item {
    fn from(key: Value) -> Self {
        Item::key_only(key)
    }
}

impl From<(Value, Value)> for Item {
    fn from((key, value): (Value, Value)) -> Self {
        Item {
            key,
            value: Some(value),
        }
    }
}

impl From<(Value, Option<Value>)> for Item {
    fn from((key, value): (Value, Option<Value>)) -> Self {
        Item { key, value }
    }
}

/// A record read back from a pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Log position within the pipe
    pub id: RecordId,
    /// Decoded key
    pub key: Value,
    /// Decoded value, `None` if stored as NULL
    pub value: Option<Value>,
    /// Insert time, milliseconds since Unix epoch
    pub created_ms: u64,
    /// How the value blob is stored on disk
    pub compression: Option<Compression>,
}

impl Record {
    /// Converts back into an item, dropping storage metadata.
    pub fn into_item(self) -> Item {
        Item {
            key: self.key,
            value: self.value,
        }
    }
}

/// Direction of a scan over record ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Oldest first: ids greater than the bound, ascending
    Ascending,
    /// Newest first: ids less than the bound, descending
    Descending,
}

// =============================================================================
// Cursors and Errors
// =============================================================================

/// How far a target pipe has consumed a source pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Row id in the `cursors` table
    pub id: CursorId,
    /// Source pipe, `None` for cursors not bound to a source
    pub source: Option<PipeId>,
    /// Consuming pipe
    pub target: PipeId,
    /// Last fully processed source record
    pub offset: RecordId,
}

/// A quarantined record in an edge's error queue, joined with the record.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEntry {
    /// The source record that failed
    pub record: Record,
    /// Number of unsuccessful retries, 0 after the first failure
    pub retries: u32,
    /// Latest failure description
    pub message: String,
    /// When the record first failed
    pub created_ms: u64,
    /// When the entry last changed
    pub updated_ms: u64,
}

/// Consumption state of one edge, for status reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeStatus {
    /// Source pipe name
    pub source: String,
    /// Target pipe name
    pub target: String,
    /// Current cursor offset
    pub offset: RecordId,
    /// Source records past the offset
    pub backlog: u64,
    /// Entries in the error queue
    pub errors: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_ordering() {
        assert!(RecordId::ZERO < RecordId::from_raw(1));
        assert_eq!(RecordId::default(), RecordId::ZERO);
    }

    #[test]
    fn test_table_names_use_ids_only() {
        let internal = PipeDef {
            id: PipeId::from_raw(3),
            name: "robert'); DROP TABLE pipes;--".to_string(),
            location: None,
        };
        assert_eq!(internal.table(), "main.records_3");

        let external = PipeDef {
            location: Some(PathBuf::from("/tmp/ext.db")),
            ..internal
        };
        assert_eq!(external.schema(), "ext_3");
        assert_eq!(external.table(), "ext_3.records_3");
    }

    #[test]
    fn test_compression_tags() {
        assert_eq!(Compression::from_tag("zstd"), Some(Compression::Zstd));
        assert_eq!(Compression::from_tag("lz4"), None);
        assert_eq!(Compression::Zstd.as_tag(), "zstd");
    }

    #[test]
    fn test_item_conversions() {
        let item: Item = (json!(1), json!({"a": 1})).into();
        assert_eq!(item.key, json!(1));
        assert_eq!(item.value, Some(json!({"a": 1})));

        let item: Item = json!("k").into();
        assert_eq!(item.value, None);
    }
}

//! # Record Store
//!
//! The append-only table behind every pipe. This module owns all SQL that
//! touches a `records_<id>` table: inserts, windowed scans, and the deletes
//! and rewrites behind dedup, compact, clean and compress.
//!
//! ## Windowed Scans
//!
//! A pipe can hold millions of records, so reads never materialize a full
//! result set. [`Scan`] fetches a bounded window, remembers the last id it
//! returned (the high-water mark), and fetches the next window only when the
//! current one is used up:
//!
//! ```text
//! window 1: SELECT ... WHERE id > 0    ORDER BY id LIMIT N   → ids 1..=N
//! window 2: SELECT ... WHERE id > N    ORDER BY id LIMIT N   → ids N+1..=2N
//! ...
//! last:     fewer than N rows                                → done
//! ```
//!
//! Because every window restarts from the high-water id rather than an SQL
//! OFFSET, records appended while a scan is running are picked up by later
//! windows, and records deleted behind the mark are never revisited.
//!
//! ## Invariant: Ids Never Move
//!
//! Every table uses `INTEGER PRIMARY KEY AUTOINCREMENT`. Deletes leave gaps;
//! survivors keep their ids; new records always get an id above any id ever
//! issued.

use std::collections::VecDeque;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::codec::{
    current_time_ms, decode_compression, decode_key, decode_value, encode_key, encode_value,
    fingerprint,
};
use crate::error::Result;
use crate::types::{Compression, Item, Order, PipeDef, Record, RecordId};

/// Columns selected for every record read, in [`decode_record`] order.
const RECORD_COLUMNS: &str = "id, key, value, created_ms, compression";

/// Column values of one record row before decoding.
type RawRecord = (i64, String, Option<Vec<u8>>, i64, Option<String>);

// =============================================================================
// Encoding
// =============================================================================

/// An item serialized and ready to insert.
///
/// Encoding happens once, when the item enters the bulk writer, so the
/// writer can account for its exact size.
#[derive(Debug, Clone)]
pub struct EncodedItem {
    key_hash: i64,
    key: String,
    value: Option<Vec<u8>>,
}

impl EncodedItem {
    /// Serializes a key/value pair.
    pub fn encode(item: &Item) -> Result<Self> {
        let key = encode_key(&item.key)?;
        Ok(Self {
            key_hash: fingerprint(&key),
            key,
            value: encode_value(item.value.as_ref(), None)?,
        })
    }

    /// Bytes this item adds to a write buffer.
    pub fn encoded_len(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Vec::len)
    }
}

/// Decodes one row selected with [`RECORD_COLUMNS`].
fn decode_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

/// Turns raw column values into a [`Record`].
fn into_record(raw: RawRecord) -> Result<Record> {
    let (id, key, value, created_ms, compression) = raw;
    let compression = decode_compression(compression.as_deref())?;
    Ok(Record {
        id: RecordId::from_raw(id),
        key: decode_key(&key)?,
        value: decode_value(value.as_deref(), compression)?,
        created_ms: created_ms as u64,
        compression,
    })
}

// =============================================================================
// Writes
// =============================================================================

/// Inserts already-encoded items in one transaction.
///
/// Every item gets a fresh id and the same `created_ms`. Returns the id of
/// the last inserted record, or `None` for an empty slice.
///
/// # Atomicity
///
/// Either every item is written or none is. The bulk writer relies on this:
/// its post-flush hook only runs after this returns `Ok`.
pub fn insert(conn: &Connection, def: &PipeDef, items: &[EncodedItem]) -> Result<Option<RecordId>> {
    if items.is_empty() {
        return Ok(None);
    }

    let now_ms = current_time_ms() as i64;
    let tx = conn.unchecked_transaction()?;
    let mut last = None;
    {
        let mut stmt = tx.prepare_cached(&format!(
            "INSERT INTO {} (key_hash, key, value, created_ms) VALUES (?, ?, ?, ?)",
            def.table()
        ))?;
        for item in items {
            stmt.execute(params![item.key_hash, item.key, item.value, now_ms])?;
            last = Some(RecordId::from_raw(tx.last_insert_rowid()));
        }
    }
    tx.commit()?;
    Ok(last)
}

/// Encodes and inserts items directly, without buffering.
pub fn append<I>(conn: &Connection, def: &PipeDef, items: I) -> Result<Option<RecordId>>
where
    I: IntoIterator,
    I::Item: Into<Item>,
{
    let encoded = items
        .into_iter()
        .map(|item| EncodedItem::encode(&item.into()))
        .collect::<Result<Vec<_>>>()?;
    insert(conn, def, &encoded)
}

/// Which record of a duplicate-key group survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    /// Smallest id (dedup)
    First,
    /// Largest id (compact, last write wins)
    Last,
}

/// Deletes all but one record per distinct key. Returns rows deleted.
///
/// Groups on `(key_hash, key)`: the fingerprint makes the grouping cheap, the
/// full key text keeps colliding fingerprints apart.
pub fn delete_duplicates(conn: &Connection, def: &PipeDef, keep: Keep) -> Result<usize> {
    let table = def.table();
    let agg = match keep {
        Keep::First => "MIN",
        Keep::Last => "MAX",
    };
    let deleted = conn.execute(
        &format!(
            "DELETE FROM {table} WHERE id NOT IN (
                 SELECT {agg}(id) FROM {table} GROUP BY key_hash, key
             )"
        ),
        [],
    )?;
    Ok(deleted)
}

/// Deletes records created before `cutoff_ms`, or every record if `None`.
pub fn delete_older_than(conn: &Connection, def: &PipeDef, cutoff_ms: Option<u64>) -> Result<usize> {
    let table = def.table();
    let deleted = match cutoff_ms {
        Some(cutoff) => conn.execute(
            &format!("DELETE FROM {table} WHERE created_ms < ?"),
            [cutoff as i64],
        )?,
        None => conn.execute(&format!("DELETE FROM {table}"), [])?,
    };
    Ok(deleted)
}

/// Rewrites stored values into the requested form. Returns rows rewritten.
///
/// `Some(Zstd)` compresses every plain value, `None` decompresses every
/// compressed one. Rows already in the requested form and rows with no value
/// are left alone. Works window by window so memory stays bounded.
pub fn rewrite_values(
    conn: &Connection,
    def: &PipeDef,
    target: Option<Compression>,
    window: usize,
) -> Result<usize> {
    let table = def.table();
    let select_filter = match target {
        Some(_) => "compression IS NULL",
        None => "compression IS NOT NULL",
    };
    let mut high_water = RecordId::ZERO;
    let mut rewritten = 0;

    loop {
        let rows = {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM {table}
                 WHERE id > ? AND value IS NOT NULL AND {select_filter}
                 ORDER BY id LIMIT ?"
            ))?;
            let raw = stmt
                .query_map(params![high_water.as_raw(), window as i64], decode_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raw.into_iter().map(into_record).collect::<Result<Vec<_>>>()?
        };
        let Some(last) = rows.last() else {
            break;
        };
        high_water = last.id;

        let tx = conn.unchecked_transaction()?;
        {
            let mut update = tx.prepare_cached(&format!(
                "UPDATE {table} SET value = ?, compression = ? WHERE id = ?"
            ))?;
            for record in &rows {
                let blob = encode_value(record.value.as_ref(), target)?;
                update.execute(params![
                    blob,
                    target.map(|c| c.as_tag()),
                    record.id.as_raw()
                ])?;
            }
        }
        tx.commit()?;
        rewritten += rows.len();

        if rows.len() < window {
            break;
        }
    }

    Ok(rewritten)
}

// =============================================================================
// Point Reads
// =============================================================================

/// Reads one record by id.
pub fn get(conn: &Connection, def: &PipeDef, id: RecordId) -> Result<Option<Record>> {
    let raw = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?", def.table()),
            [id.as_raw()],
            decode_record,
        )
        .optional()?;
    raw.map(into_record).transpose()
}

/// Highest id currently stored, `RecordId::ZERO` for an empty pipe.
pub fn max_id(conn: &Connection, def: &PipeDef) -> Result<RecordId> {
    let max: Option<i64> = conn.query_row(
        &format!("SELECT MAX(id) FROM {}", def.table()),
        [],
        |row| row.get(0),
    )?;
    Ok(RecordId::from_raw(max.unwrap_or(0)))
}

/// Number of records with id greater than `after`.
pub fn count_after(conn: &Connection, def: &PipeDef, after: RecordId) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE id > ?", def.table()),
        [after.as_raw()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Whether any record has id greater than `after`.
pub fn exists_after(conn: &Connection, def: &PipeDef, after: RecordId) -> Result<bool> {
    let exists: i64 = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id > ?)", def.table()),
        [after.as_raw()],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

/// Id of the `n`-th record after `offset` (1-based), if that many exist.
pub fn nth_after(conn: &Connection, def: &PipeDef, offset: RecordId, n: u64) -> Result<Option<RecordId>> {
    debug_assert!(n > 0);
    let id: Option<i64> = conn
        .query_row(
            &format!("SELECT id FROM {} WHERE id > ? ORDER BY id LIMIT 1 OFFSET ?", def.table()),
            params![offset.as_raw(), (n - 1) as i64],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.map(RecordId::from_raw))
}

/// Cursor position that un-consumes `n` records before `offset`.
///
/// The records at or below `offset` are, newest first, `r0, r1, r2, ...`.
/// Stepping back `n` records makes `r0..r(n-1)` visible again, so the new
/// offset is the id of `r(n)`. `None` if fewer than `n + 1` such records
/// exist, meaning the caller should rewind to the very beginning.
pub fn nth_at_or_before(
    conn: &Connection,
    def: &PipeDef,
    offset: RecordId,
    n: u64,
) -> Result<Option<RecordId>> {
    // No table holds more than i64::MAX rows, and SQLite reads a negative
    // OFFSET as zero.
    let Ok(skip) = i64::try_from(n) else {
        return Ok(None);
    };
    let id: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT id FROM {} WHERE id <= ? ORDER BY id DESC LIMIT 1 OFFSET ?",
                def.table()
            ),
            params![offset.as_raw(), skip],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.map(RecordId::from_raw))
}

// =============================================================================
// Windowed Scan
// =============================================================================

/// A lazy, windowed iterator over a pipe's records.
///
/// Yields `Result<Record>` so a storage error surfaces at the record where it
/// happened; after an error the scan is finished.
///
/// # Example
///
/// ```rust
/// use pipedb::Pipes;
/// use pipedb::types::RecordId;
/// use serde_json::json;
///
/// let pipes = Pipes::open_in_memory()?;
/// let raw = pipes.define("raw")?;
/// raw.append((1..=5).map(|i| json!(i)))?;
///
/// let ids: Vec<i64> = raw
///     .scan_after(RecordId::from_raw(2))
///     .map(|r| r.map(|rec| rec.id.as_raw()))
///     .collect::<pipedb::Result<_>>()?;
/// assert_eq!(ids, vec![3, 4, 5]);
/// # Ok::<(), pipedb::Error>(())
/// ```
pub struct Scan<'c> {
    conn: &'c Connection,
    table: String,
    order: Order,
    window: usize,
    /// Last id handed out; the next window starts strictly past it.
    high_water: Option<RecordId>,
    /// Optional `(key_hash, key)` filter.
    key: Option<(i64, String)>,
    /// Records still to hand out, across all windows.
    remaining: Option<usize>,
    buffer: VecDeque<Record>,
    exhausted: bool,
}

impl<'c> Scan<'c> {
    /// Scans records with id greater than `after` (ascending) or less than
    /// `before` (descending; `None` means from the newest record).
    pub fn new(conn: &'c Connection, def: &PipeDef, bound: Option<RecordId>, order: Order, window: usize) -> Self {
        Self {
            conn,
            table: def.table(),
            order,
            window: window.max(1),
            high_water: bound,
            key: None,
            remaining: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Only yields records whose key equals `key`.
    pub fn with_key(mut self, key: &Value) -> Result<Self> {
        let encoded = encode_key(key)?;
        self.key = Some((fingerprint(&encoded), encoded));
        Ok(self)
    }

    /// Stops after `limit` records (0 = unbounded).
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.remaining = (limit > 0).then_some(limit);
        self
    }

    /// Fetches the next window into the buffer.
    fn fetch(&mut self) -> Result<()> {
        let size = match self.remaining {
            Some(remaining) => remaining.min(self.window),
            None => self.window,
        };

        let (cmp, dir) = match self.order {
            Order::Ascending => (">", "ASC"),
            Order::Descending => ("<", "DESC"),
        };
        // Ascending scans always have a bound (0 at worst). Descending scans
        // start unbounded and pick up their bound from the first window.
        let bound_clause = match self.high_water {
            Some(_) => format!("id {cmp} ?1"),
            None => "?1 IS NULL".to_string(),
        };
        let key_clause = match self.key {
            Some(_) => "AND key_hash = ?3 AND key = ?4",
            None => "AND ?3 IS NULL AND ?4 IS NULL",
        };
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE {bound_clause} {key_clause} ORDER BY id {dir} LIMIT ?2",
            self.table
        );

        let (key_hash, key_text) = match &self.key {
            Some((hash, text)) => (Some(*hash), Some(text.as_str())),
            None => (None, None),
        };

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let raw = stmt
            .query_map(
                params![
                    self.high_water.map(|id| id.as_raw()),
                    size as i64,
                    key_hash,
                    key_text
                ],
                decode_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if raw.len() < size {
            self.exhausted = true;
        }
        for row in raw {
            self.buffer.push_back(into_record(row)?);
        }
        if let Some(last) = self.buffer.back() {
            self.high_water = Some(last.id);
        }
        Ok(())
    }
}

impl Iterator for Scan<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch() {
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }
        let record = self.buffer.pop_front()?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(Ok(record))
    }
}

// =============================================================================
// Tests
// =============================================================================

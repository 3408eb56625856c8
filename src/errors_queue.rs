//! # Error Queue
//!
//! Per-edge quarantine for records a handler failed on. A failing record does
//! not stop a run; it is written here and the cursor moves on. Entries stay
//! until a successful `retry` or an explicit `resolve`.
//!
//! ## One Entry per (Cursor, Record)
//!
//! ```text
//! first failure:   INSERT   retries = 0, message = m1
//! retry fails:     UPDATE   retries = 1, message = m2, updated_ms = now
//! retry succeeds:  DELETE
//! ```
//!
//! The UNIQUE(cursor, record) constraint plus `ON CONFLICT DO UPDATE` makes
//! `report` an upsert. Concurrent writers on the same edge are not supported
//! (single writer per edge is a precondition of the whole engine), so no
//! further locking is done.
//!
//! ## Reading Entries Back
//!
//! Entries are listed together with the source record they refer to. When
//! the source pipe lives in the main database this is a single JOIN. For an
//! external source the listing takes two steps: fetch a window of error rows,
//! then fetch each referenced record by id from the external store.
//! Entries whose record has since been deleted (by dedup, compact or clean)
//! are skipped either way.

use std::collections::VecDeque;

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::codec::{current_time_ms, decode_compression, decode_key, decode_value, encode_key, fingerprint};
use crate::error::Result;
use crate::store;
use crate::types::{CursorId, ErrorEntry, PipeDef, Record, RecordId};

// =============================================================================
// Writes
// =============================================================================

/// Records a failure for `record` on `cursor`'s edge.
///
/// Inserts a new entry with `retries = 0`, or bumps `retries` and replaces
/// the message if the record already has one. Returns the retry count now
/// stored.
pub fn report(conn: &Connection, cursor: CursorId, record: RecordId, message: &str) -> Result<u32> {
    let now_ms = current_time_ms() as i64;
    let retries: i64 = conn.query_row(
        "INSERT INTO pipe_errors (cursor, record, retries, message, created_ms, updated_ms)
         VALUES (?1, ?2, 0, ?3, ?4, ?4)
         ON CONFLICT(cursor, record) DO UPDATE SET
             retries = retries + 1,
             message = excluded.message,
             updated_ms = excluded.updated_ms
         RETURNING retries",
        params![cursor.as_raw(), record.as_raw(), message, now_ms],
        |row| row.get(0),
    )?;
    Ok(retries as u32)
}

/// Deletes the entry for one record. Returns whether an entry existed.
pub fn resolve_record(conn: &Connection, cursor: CursorId, record: RecordId) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM pipe_errors WHERE cursor = ? AND record = ?",
        params![cursor.as_raw(), record.as_raw()],
    )?;
    Ok(deleted > 0)
}

/// Deletes entries on an edge, optionally only those whose record has `key`.
///
/// Neither the source nor the target pipe is touched. Returns entries deleted.
pub fn resolve(conn: &Connection, cursor: CursorId, source: &PipeDef, key: Option<&Value>) -> Result<usize> {
    let deleted = match key {
        None => conn.execute("DELETE FROM pipe_errors WHERE cursor = ?", [cursor.as_raw()])?,
        Some(key) => {
            let encoded = encode_key(key)?;
            conn.execute(
                &format!(
                    "DELETE FROM pipe_errors WHERE cursor = ? AND record IN (
                         SELECT id FROM {} WHERE key_hash = ? AND key = ?
                     )",
                    source.table()
                ),
                params![cursor.as_raw(), fingerprint(&encoded), encoded],
            )?
        }
    };
    Ok(deleted)
}

/// Number of entries on an edge that [`ErrorScan`] would list, i.e. those
/// whose record still exists in `source`.
pub fn count(conn: &Connection, cursor: CursorId, source: &PipeDef) -> Result<u64> {
    if source.is_external() {
        return count_two_step(conn, cursor, source);
    }
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM pipe_errors pe JOIN {} r ON r.id = pe.record
             WHERE pe.cursor = ?",
            source.table()
        ),
        [cursor.as_raw()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn count_two_step(conn: &Connection, cursor: CursorId, source: &PipeDef) -> Result<u64> {
    let records = {
        let mut stmt = conn.prepare_cached("SELECT record FROM pipe_errors WHERE cursor = ?")?;
        let rows = stmt
            .query_map([cursor.as_raw()], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut exists =
        conn.prepare_cached(&format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)", source.table()))?;
    let mut live = 0;
    for record in records {
        if exists.query_row([record], |row| row.get::<_, bool>(0))? {
            live += 1;
        }
    }
    Ok(live)
}

// =============================================================================
// Windowed Listing
// =============================================================================

/// Raw error-row columns: entry id, record id, retries, message, created, updated.
type RawEntry = (i64, i64, i64, String, i64, i64);

/// A lazy, windowed iterator over an edge's error entries, oldest first
/// (or newest first when reversed).
pub struct ErrorScan<'c> {
    conn: &'c Connection,
    cursor: CursorId,
    source: PipeDef,
    key: Option<(i64, String)>,
    reverse: bool,
    window: usize,
    /// Last entry id handed out.
    high_water: Option<i64>,
    buffer: VecDeque<ErrorEntry>,
    exhausted: bool,
}

impl<'c> ErrorScan<'c> {
    /// Lists entries on `cursor`'s edge whose records live in `source`.
    pub fn new(conn: &'c Connection, cursor: CursorId, source: &PipeDef, window: usize) -> Self {
        Self {
            conn,
            cursor,
            source: source.clone(),
            key: None,
            reverse: false,
            window: window.max(1),
            high_water: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// A scan that yields nothing, for an edge that has never been used.
    pub fn empty(conn: &'c Connection, source: &PipeDef) -> Self {
        let mut scan = Self::new(conn, CursorId::from_raw(0), source, 1);
        scan.exhausted = true;
        scan
    }

    /// Only lists entries whose record has this key.
    pub fn with_key(mut self, key: &Value) -> Result<Self> {
        let encoded = encode_key(key)?;
        self.key = Some((fingerprint(&encoded), encoded));
        Ok(self)
    }

    /// Newest entries first.
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    fn bound_clause(&self) -> (&'static str, &'static str) {
        match (self.reverse, self.high_water.is_some()) {
            (false, true) => ("pe.id > ?2", "ASC"),
            (true, true) => ("pe.id < ?2", "DESC"),
            (false, false) => ("?2 IS NULL", "ASC"),
            (true, false) => ("?2 IS NULL", "DESC"),
        }
    }

    /// Single-query window: error rows joined with the source records.
    fn fetch_joined(&mut self) -> Result<usize> {
        let (bound, dir) = self.bound_clause();
        let key_clause = match self.key {
            Some(_) => "AND r.key_hash = ?4 AND r.key = ?5",
            None => "AND ?4 IS NULL AND ?5 IS NULL",
        };
        let sql = format!(
            "SELECT pe.id, pe.record, pe.retries, pe.message, pe.created_ms, pe.updated_ms,
                    r.id, r.key, r.value, r.created_ms, r.compression
             FROM pipe_errors pe
             JOIN {} r ON r.id = pe.record
             WHERE pe.cursor = ?1 AND {bound} {key_clause}
             ORDER BY pe.id {dir}
             LIMIT ?3",
            self.source.table()
        );
        let (key_hash, key_text) = split_key(&self.key);

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(
                params![self.cursor.as_raw(), self.high_water, self.window as i64, key_hash, key_text],
                |row| {
                    let entry: RawEntry = (
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    );
                    let record = (
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Option<Vec<u8>>>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    );
                    Ok((entry, record))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let fetched = rows.len();
        for (entry, (id, key, value, created_ms, compression)) in rows {
            self.high_water = Some(entry.0);
            let compression = decode_compression(compression.as_deref())?;
            let record = Record {
                id: RecordId::from_raw(id),
                key: decode_key(&key)?,
                value: decode_value(value.as_deref(), compression)?,
                created_ms: created_ms as u64,
                compression,
            };
            self.buffer.push_back(into_entry(entry, record));
        }
        Ok(fetched)
    }

    /// Two-step window for external sources: error rows, then records by id.
    fn fetch_two_step(&mut self) -> Result<usize> {
        let (bound, dir) = self.bound_clause();
        let sql = format!(
            "SELECT pe.id, pe.record, pe.retries, pe.message, pe.created_ms, pe.updated_ms
             FROM pipe_errors pe
             WHERE pe.cursor = ?1 AND {bound}
             ORDER BY pe.id {dir}
             LIMIT ?3"
        );

        let entries = {
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(
                    params![self.cursor.as_raw(), self.high_water, self.window as i64],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )?
                .collect::<rusqlite::Result<Vec<RawEntry>>>()?;
            rows
        };

        let fetched = entries.len();
        for entry in entries {
            self.high_water = Some(entry.0);
            let Some(record) = store::get(self.conn, &self.source, RecordId::from_raw(entry.1))? else {
                continue;
            };
            if let Some((_, key_text)) = &self.key {
                if &encode_key(&record.key)? != key_text {
                    continue;
                }
            }
            self.buffer.push_back(into_entry(entry, record));
        }
        Ok(fetched)
    }
}

fn split_key(key: &Option<(i64, String)>) -> (Option<i64>, Option<&str>) {
    match key {
        Some((hash, text)) => (Some(*hash), Some(text.as_str())),
        None => (None, None),
    }
}

fn into_entry(raw: RawEntry, record: Record) -> ErrorEntry {
    let (_, _, retries, message, created_ms, updated_ms) = raw;
    ErrorEntry {
        record,
        retries: retries as u32,
        message,
        created_ms: created_ms as u64,
        updated_ms: updated_ms as u64,
    }
}

impl Iterator for ErrorScan<'_> {
    type Item = Result<ErrorEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        // A two-step window can come back empty after filtering even though
        // more rows follow, so keep fetching until something is buffered.
        while self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            let fetched = if self.source.is_external() {
                self.fetch_two_step()
            } else {
                self.fetch_joined()
            };
            match fetched {
                Ok(n) if n < self.window => self.exhausted = true,
                Ok(_) => {}
                Err(e) => {
                    self.exhausted = true;
                    self.buffer.clear();
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # Cursor Registry
//!
//! One row per (source, target) edge recording how far the target has
//! consumed the source.
//!
//! ## Lifecycle
//!
//! ```text
//!            get_or_create            advance(id)   (after a flush)
//!   (none) ───────────────► offset 0 ─────────────► offset id ──┐
//!                              ▲                       │   ▲    │
//!                              └───── reset ───────────┘   └────┘
//!                                    skip  → max(source id)
//!                                    seek  → computed id
//! ```
//!
//! Cursors are created lazily the first time an edge is used and are never
//! deleted. An offset may point past the current maximum source id after
//! records were deleted; that just means nothing is left to consume.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::types::{Cursor, CursorId, PipeId, RecordId};

const CURSOR_COLUMNS: &str = "id, source, target, position";

fn decode_cursor(row: &Row<'_>) -> rusqlite::Result<Cursor> {
    let id: i64 = row.get(0)?;
    let source: Option<i64> = row.get(1)?;
    let target: i64 = row.get(2)?;
    let position: i64 = row.get(3)?;
    Ok(Cursor {
        id: CursorId::from_raw(id),
        source: source.map(PipeId::from_raw),
        target: PipeId::from_raw(target),
        offset: RecordId::from_raw(position),
    })
}

/// Looks up the cursor for an edge without creating it.
pub fn find(conn: &Connection, source: Option<PipeId>, target: PipeId) -> Result<Option<Cursor>> {
    let cursor = conn
        .query_row(
            &format!("SELECT {CURSOR_COLUMNS} FROM cursors WHERE source IS ? AND target = ?"),
            params![source.map(|s| s.as_raw()), target.as_raw()],
            decode_cursor,
        )
        .optional()?;
    Ok(cursor)
}

/// Returns the cursor for an edge, creating it at offset 0 if needed.
pub fn get_or_create(conn: &Connection, source: Option<PipeId>, target: PipeId) -> Result<Cursor> {
    if let Some(cursor) = find(conn, source, target)? {
        return Ok(cursor);
    }

    conn.execute(
        "INSERT INTO cursors (source, target, position) VALUES (?, ?, 0)",
        params![source.map(|s| s.as_raw()), target.as_raw()],
    )?;
    Ok(Cursor {
        id: CursorId::from_raw(conn.last_insert_rowid()),
        source,
        target,
        offset: RecordId::ZERO,
    })
}

/// Reads a cursor's current offset.
pub fn offset(conn: &Connection, cursor: CursorId) -> Result<RecordId> {
    let position: i64 = conn.query_row(
        "SELECT position FROM cursors WHERE id = ?",
        [cursor.as_raw()],
        |row| row.get(0),
    )?;
    Ok(RecordId::from_raw(position))
}

/// Sets a cursor's offset.
///
/// Normal processing only moves forward; `reset`/`seek` move it back
/// explicitly, so no direction is enforced here.
pub fn advance(conn: &Connection, cursor: CursorId, to: RecordId) -> Result<()> {
    conn.execute(
        "UPDATE cursors SET position = ? WHERE id = ?",
        params![to.as_raw(), cursor.as_raw()],
    )?;
    tracing::trace!(cursor = cursor.as_raw(), offset = to.as_raw(), "cursor moved");
    Ok(())
}

/// All cursors consuming into `target`, ordered by creation.
pub fn list_for_target(conn: &Connection, target: PipeId) -> Result<Vec<Cursor>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CURSOR_COLUMNS} FROM cursors WHERE target = ? ORDER BY id"
    ))?;
    let cursors = stmt
        .query_map([target.as_raw()], decode_cursor)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(cursors)
}

/// Every cursor in the database, ordered by creation.
pub fn list_all(conn: &Connection) -> Result<Vec<Cursor>> {
    let mut stmt = conn.prepare(&format!("SELECT {CURSOR_COLUMNS} FROM cursors ORDER BY id"))?;
    let cursors = stmt
        .query_map([], decode_cursor)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(cursors)
}

// =============================================================================
// Tests
// =============================================================================

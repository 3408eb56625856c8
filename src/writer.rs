//! # Bulk Writer
//!
//! Buffers outgoing records and writes them to a pipe in batches, one SQLite
//! transaction per batch.
//!
//! ## Why Buffer?
//!
//! Each transaction commit costs an fsync. Writing handler output record by
//! record would pay that cost for every derived record; buffering pays it once
//! per batch:
//!
//! ```text
//! Without buffering:               With buffering:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ out1 → BEGIN → COMMIT    │     │ out1, out2, out3 ...     │
//! │ out2 → BEGIN → COMMIT    │     │ BEGIN                    │
//! │ out3 → BEGIN → COMMIT    │     │   INSERT × N             │
//! │ ...                      │     │ COMMIT                   │
//! │ N fsyncs                 │     │ post-flush hook          │
//! └──────────────────────────┘     └──────────────────────────┘
//! ```
//!
//! ## Flush Triggers
//!
//! - **Size**: the buffered bytes plus the incoming item would exceed
//!   `max_bytes`. The buffer is flushed first, then the item is buffered
//!   alone.
//! - **Age**: the oldest buffered item is older than `max_age`. Checked when
//!   the next item arrives.
//! - **Forced**: [`BulkWriter::save`].
//!
//! ## The Post-Flush Hook
//!
//! A consumer must never move its cursor past a record whose output is still
//! sitting in this buffer; a crash would lose that output while the cursor
//! claims it was processed. So cursor updates are not made directly. They
//! are registered as a hook that runs after each successful commit:
//!
//! ```text
//! stage:  append(out) ... append(out)
//! flush:  BEGIN; INSERT ...; COMMIT
//! then:   hook(conn)            ← e.g. UPDATE cursors SET position = ?
//! ```
//!
//! If the insert fails the hook does not run and the error propagates.
//!
//! ## Invariants
//!
//! - Items are written in the order they were appended
//! - The hook fires after every successful non-empty flush and after every
//!   `save()`, never after a failed one
//! - Flushing an empty buffer is a no-op unless forced

use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::store::{self, EncodedItem};
use crate::types::{Item, PipeDef, RecordId};

/// Continuation run after a successful flush.
pub type FlushHook = Box<dyn FnMut(&Connection) -> Result<()>>;

// =============================================================================
// Writer Configuration
// =============================================================================

/// Thresholds for the bulk writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Flush when buffered bytes would exceed this.
    pub max_bytes: usize,

    /// Flush when the oldest buffered item is older than this.
    pub max_age: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for WriterConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_bytes: config.buffer_bytes,
            max_age: config.buffer_age(),
        }
    }
}

/// Why a flush happened, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Size,
    Age,
    Save,
}

// =============================================================================
// Bulk Writer
// =============================================================================

/// A buffered writer for one pipe.
///
/// # Usage
///
/// ```rust
/// use pipedb::Pipes;
/// use serde_json::json;
///
/// let pipes = Pipes::open_in_memory()?;
/// let out = pipes.define("out")?;
///
/// let mut writer = out.writer();
/// writer.append(json!("a"))?;
/// writer.append((json!("b"), json!({"n": 2})))?;
/// assert_eq!(out.count()?, 0); // still buffered
///
/// writer.save()?;
/// assert_eq!(out.count()?, 2);
/// # Ok::<(), pipedb::Error>(())
/// ```
///
/// Dropping a writer with buffered items discards them (and logs a warning);
/// call [`save`](Self::save) before letting it go.
pub struct BulkWriter<'c> {
    conn: &'c Connection,
    def: PipeDef,
    config: WriterConfig,
    buffer: Vec<EncodedItem>,
    buffered_bytes: usize,
    first_pending: Option<Instant>,
    hook: Option<FlushHook>,
    flushes: usize,
    written: usize,
    last_written: Option<RecordId>,
}

impl<'c> BulkWriter<'c> {
    /// Creates a writer for `def`'s record table.
    pub fn new(conn: &'c Connection, def: PipeDef, config: WriterConfig) -> Self {
        Self {
            conn,
            def,
            config,
            buffer: Vec::new(),
            buffered_bytes: 0,
            first_pending: None,
            hook: None,
            flushes: 0,
            written: 0,
            last_written: None,
        }
    }

    /// Registers the continuation to run after every successful flush.
    ///
    /// Replaces any previously registered hook.
    pub fn on_flush(&mut self, hook: impl FnMut(&Connection) -> Result<()> + 'static) {
        self.hook = Some(Box::new(hook));
    }

    /// Buffers one item, flushing the existing buffer first if a threshold
    /// has been reached.
    pub fn append(&mut self, item: impl Into<Item>) -> Result<()> {
        let encoded = EncodedItem::encode(&item.into())?;

        if !self.buffer.is_empty() {
            if self.buffered_bytes + encoded.encoded_len() > self.config.max_bytes {
                self.flush(FlushReason::Size)?;
            } else if self
                .first_pending
                .is_some_and(|since| since.elapsed() > self.config.max_age)
            {
                self.flush(FlushReason::Age)?;
            }
        }

        self.buffered_bytes += encoded.encoded_len();
        self.buffer.push(encoded);
        if self.first_pending.is_none() {
            self.first_pending = Some(Instant::now());
        }
        Ok(())
    }

    /// Buffers every item of a sequence.
    pub fn extend<I>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<Item>,
    {
        for item in items {
            self.append(item)?;
        }
        Ok(())
    }

    /// Writes whatever is buffered and fires the hook, even if the buffer
    /// is empty.
    pub fn save(&mut self) -> Result<()> {
        self.flush(FlushReason::Save)
    }

    fn flush(&mut self, reason: FlushReason) -> Result<()> {
        let forced = reason == FlushReason::Save;
        if self.buffer.is_empty() && !forced {
            return Ok(());
        }

        let rows = self.buffer.len();
        if rows > 0 {
            self.last_written = store::insert(self.conn, &self.def, &self.buffer)?;
            tracing::debug!(
                pipe = %self.def.name,
                rows,
                bytes = self.buffered_bytes,
                ?reason,
                "flushed bulk writer"
            );
        }

        self.buffer.clear();
        self.buffered_bytes = 0;
        self.first_pending = None;
        self.flushes += 1;
        self.written += rows;

        if let Some(hook) = self.hook.as_mut() {
            hook(self.conn)?;
        }
        Ok(())
    }

    /// Items currently buffered.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Encoded bytes currently buffered.
    pub fn pending_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Flushes performed so far, including forced empty ones.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Items written to disk so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Id of the last record written, if any.
    pub fn last_written(&self) -> Option<RecordId> {
        self.last_written
    }
}

impl Drop for BulkWriter<'_> {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            tracing::warn!(
                pipe = %self.def.name,
                discarded = self.buffer.len(),
                "bulk writer dropped with unsaved items"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{create_record_table, Database};
    use crate::types::PipeId;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    fn setup() -> (Database, PipeDef) {
        let db = Database::open_in_memory().unwrap();
        let def = PipeDef {
            id: PipeId::from_raw(1),
            name: "out".to_string(),
            location: None,
        };
        create_record_table(db.connection(), &def).unwrap();
        (db, def)
    }

    fn count(conn: &Connection, def: &PipeDef) -> u64 {
        store::count_after(conn, def, RecordId::ZERO).unwrap()
    }

    fn counting_hook(writer: &mut BulkWriter<'_>) -> Rc<Cell<usize>> {
        let fired = Rc::new(Cell::new(0));
        let seen = Rc::clone(&fired);
        writer.on_flush(move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        });
        fired
    }

    #[test]
    fn test_size_threshold_flushes_before_buffering() {
        let (db, def) = setup();
        let conn = db.connection();
        // Each item is the 3-byte key "\"k\"" plus no value.
        let config = WriterConfig {
            max_bytes: 7,
            max_age: Duration::from_secs(3600),
        };
        let mut writer = BulkWriter::new(conn, def.clone(), config);
        let fired = counting_hook(&mut writer);

        writer.append(json!("k")).unwrap();
        writer.append(json!("k")).unwrap();
        assert_eq!(writer.pending(), 2);
        assert_eq!(fired.get(), 0);

        // 6 + 3 > 7: flush the two buffered items, then buffer this one alone.
        writer.append(json!("k")).unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(writer.pending(), 1);
        assert_eq!(count(conn, &def), 2);

        writer.save().unwrap();
        assert_eq!(fired.get(), 2);
        assert_eq!(count(conn, &def), 3);
    }

    #[test]
    fn test_age_threshold_flushes() {
        let (db, def) = setup();
        let conn = db.connection();
        let config = WriterConfig {
            max_bytes: usize::MAX,
            max_age: Duration::ZERO,
        };
        let mut writer = BulkWriter::new(conn, def.clone(), config);

        writer.append(json!(1)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        writer.append(json!(2)).unwrap();

        assert_eq!(count(conn, &def), 1);
        assert_eq!(writer.pending(), 1);
        writer.save().unwrap();
    }

    #[test]
    fn test_empty_save_still_fires_hook() {
        let (db, def) = setup();
        let mut writer = BulkWriter::new(db.connection(), def, WriterConfig::default());
        let fired = counting_hook(&mut writer);

        writer.save().unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(writer.written(), 0);
    }

    #[test]
    fn test_hook_error_propagates_after_write() {
        let (db, def) = setup();
        let conn = db.connection();
        let mut writer = BulkWriter::new(conn, def.clone(), WriterConfig::default());
        writer.on_flush(|_| Err(crate::Error::Schema("hook failed".to_string())));

        writer.append(json!(1)).unwrap();
        assert!(writer.save().is_err());
        // The write itself committed before the hook ran.
        assert_eq!(count(conn, &def), 1);
    }

    #[test]
    fn test_last_written_tracks_ids() {
        let (db, def) = setup();
        let mut writer = BulkWriter::new(db.connection(), def, WriterConfig::default());
        writer.extend([json!("a"), json!("b")]).unwrap();
        writer.save().unwrap();
        assert_eq!(writer.last_written(), Some(RecordId::from_raw(2)));
        assert_eq!(writer.flushes(), 1);
    }
}

//! # Pipes
//!
//! A pipe is a named, append-only record store. Pipes are connected by
//! edges: a target pipe consumes a source pipe through a cursor, running a
//! handler over every record it has not seen yet and appending the results
//! to itself.
//!
//! ```text
//!   ┌────────┐  call(handler)   ┌────────┐  call(handler)   ┌────────┐
//!   │  urls  │ ───────────────► │ pages  │ ───────────────► │ items  │
//!   └────────┘  cursor(urls →   └────────┘  cursor(pages →  └────────┘
//!                      pages)        │             items)
//!                                    ▼
//!                           pipe_errors (per edge)
//! ```
//!
//! [`Pipes`] is the registry: it owns the database and hands out [`Pipe`]
//! handles. A `Pipe` borrows the registry, so every scan, writer and handle
//! is tied to the connection it reads from.
//!
//! ## The Call Loop
//!
//! ```text
//! for record in source.scan_after(cursor.offset):
//!     handler(record)
//!       Ok(items)  → writer.extend(items)
//!       Err(fail)  → pipe_errors.report(record)
//!     pending = record.id
//!
//! writer flush (size, age, or final save)
//!     └─ post-flush hook: cursor.offset = pending
//! ```
//!
//! The cursor only moves inside the writer's post-flush hook, so it never
//! points past a record whose output is still buffered. A crash loses at most
//! the unflushed tail, and that tail is processed again on the next run.
//!
//! ## Source Is Explicit
//!
//! Every edge operation takes the source pipe as a parameter. The same target
//! can consume several sources; each pair has its own cursor and error queue.
//!
//! ## Preconditions
//!
//! One writer per edge at a time. Nothing here locks an edge against a
//! concurrent `call` from another process.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::codec::current_time_ms;
use crate::config::EngineConfig;
use crate::cursor;
use crate::error::{Error, HandlerError, Result};
use crate::errors_queue::{self, ErrorScan};
use crate::handler::{self, Download, Handler};
use crate::schema::{attach_external, create_record_table, Database};
use crate::store::{self, Keep, Scan};
use crate::types::{
    Compression, Cursor, EdgeStatus, Item, Order, PipeDef, PipeId, Record, RecordId,
};
use crate::writer::{BulkWriter, WriterConfig};

// =============================================================================
// Call Options
// =============================================================================

/// A cloneable stop request shared between a running pipeline and whoever
/// wants it to stop (e.g. a Ctrl-C handler on another thread).
///
/// A running `call` checks the flag before each record. When set, it flushes
/// what it has buffered, advances the cursor accordingly, and returns
/// [`Error::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Creates a flag that is not set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks every run holding a clone of this flag to stop.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag so the next run can proceed.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-invocation knobs for `call`, `download` and `retry`.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Maximum source records processed (0 = all). Ignored by `retry`.
    pub limit: usize,
    /// Failures that abort the call (0 = never). Ignored by `retry`.
    pub error_limit: usize,
    /// Optional stop flag.
    pub interrupt: Option<Interrupt>,
}

impl CallOptions {
    /// Sets the record limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the error limit.
    pub fn with_error_limit(mut self, error_limit: usize) -> Self {
        self.error_limit = error_limit;
        self
    }

    /// Attaches a stop flag.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(Interrupt::is_requested)
    }
}

impl From<&EngineConfig> for CallOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            limit: config.limit,
            error_limit: config.error_limit,
            interrupt: None,
        }
    }
}

/// What one `call`, `download` or `retry` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallReport {
    /// Source records handed to the handler
    pub processed: usize,
    /// Records the handler accepted
    pub succeeded: usize,
    /// Records quarantined (call) or still failing (retry)
    pub failed: usize,
    /// Output items written to the target
    pub written: usize,
}

// =============================================================================
// Registry
// =============================================================================

/// The set of pipes in one database.
///
/// # Example
///
/// ```rust
/// use pipedb::handler::from_fn;
/// use pipedb::types::{Item, Record};
/// use pipedb::{CallOptions, Pipes};
/// use serde_json::json;
///
/// let pipes = Pipes::open_in_memory()?;
/// let numbers = pipes.define("numbers")?;
/// let squares = pipes.define("squares")?;
///
/// numbers.append([json!(1), json!(2), json!(3)])?;
/// let report = squares.call(
///     &numbers,
///     &mut from_fn(|r: &Record| {
///         let n = r.key.as_i64().unwrap_or(0);
///         Ok(vec![Item::key_only(n * n)])
///     }),
///     &CallOptions::default(),
/// )?;
///
/// assert_eq!(report.written, 3);
/// assert_eq!(squares.backlog_len(&numbers)?, 0);
/// # Ok::<(), pipedb::Error>(())
/// ```
pub struct Pipes {
    db: Database,
    config: EngineConfig,
}

const PIPE_COLUMNS: &str = "id, name, location";

fn decode_def(row: &Row<'_>) -> rusqlite::Result<PipeDef> {
    let location: Option<String> = row.get(2)?;
    Ok(PipeDef {
        id: PipeId::from_raw(row.get(0)?),
        name: row.get(1)?,
        location: location.map(Into::into),
    })
}

impl Pipes {
    /// Opens (or creates) a pipe database with the default configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    /// Opens (or creates) a pipe database.
    ///
    /// External stores of previously defined pipes are attached again.
    pub fn open_with_config(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Self::from_database(Database::open(path)?, config)
    }

    /// Opens an in-memory registry, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(EngineConfig::default())
    }

    /// Opens an in-memory registry with a custom configuration.
    pub fn open_in_memory_with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Self::from_database(Database::open_in_memory()?, config)
    }

    fn from_database(db: Database, config: EngineConfig) -> Result<Self> {
        let pipes = Self { db, config };
        for def in pipes.list()? {
            if def.is_external() {
                attach_external(pipes.connection(), &def)?;
                create_record_table(pipes.connection(), &def)?;
            }
        }
        Ok(pipes)
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        self.db.connection()
    }

    /// The configuration every pipe handle uses.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Defines a new pipe stored in the main database.
    ///
    /// # Errors
    ///
    /// `Error::PipeExists` if the name is taken.
    pub fn define(&self, name: &str) -> Result<Pipe<'_>> {
        let def = self.insert_def(name, None)?;
        if let Err(e) = create_record_table(self.connection(), &def) {
            self.remove_def(&def)?;
            return Err(e);
        }
        tracing::info!(pipe = name, id = def.id.as_raw(), "pipe defined");
        Ok(self.handle(def))
    }

    /// Defines a new pipe whose records live in a separate database file.
    ///
    /// The file is created if needed and attached to this connection; it is
    /// attached again every time the registry is opened.
    pub fn define_external(&self, name: &str, path: impl AsRef<Path>) -> Result<Pipe<'_>> {
        let def = self.insert_def(name, Some(path.as_ref()))?;
        let created = attach_external(self.connection(), &def)
            .and_then(|()| create_record_table(self.connection(), &def));
        if let Err(e) = created {
            self.remove_def(&def)?;
            return Err(e);
        }
        tracing::info!(
            pipe = name,
            id = def.id.as_raw(),
            location = %path.as_ref().display(),
            "external pipe defined"
        );
        Ok(self.handle(def))
    }

    fn insert_def(&self, name: &str, location: Option<&Path>) -> Result<PipeDef> {
        if self.find_def(name)?.is_some() {
            return Err(Error::PipeExists {
                name: name.to_string(),
            });
        }
        let location = location
            .map(|p| {
                p.to_str().map(str::to_string).ok_or_else(|| {
                    Error::Schema(format!("external path is not UTF-8: {}", p.display()))
                })
            })
            .transpose()?;

        self.connection().execute(
            "INSERT INTO pipes (name, location, created_ms) VALUES (?, ?, ?)",
            params![name, location, current_time_ms() as i64],
        )?;
        Ok(PipeDef {
            id: PipeId::from_raw(self.connection().last_insert_rowid()),
            name: name.to_string(),
            location: location.map(Into::into),
        })
    }

    fn remove_def(&self, def: &PipeDef) -> Result<()> {
        self.connection()
            .execute("DELETE FROM pipes WHERE id = ?", [def.id.as_raw()])?;
        Ok(())
    }

    fn find_def(&self, name: &str) -> Result<Option<PipeDef>> {
        let def = self
            .connection()
            .query_row(
                &format!("SELECT {PIPE_COLUMNS} FROM pipes WHERE name = ?"),
                [name],
                decode_def,
            )
            .optional()?;
        Ok(def)
    }

    fn find_def_by_id(&self, id: PipeId) -> Result<Option<PipeDef>> {
        let def = self
            .connection()
            .query_row(
                &format!("SELECT {PIPE_COLUMNS} FROM pipes WHERE id = ?"),
                [id.as_raw()],
                decode_def,
            )
            .optional()?;
        Ok(def)
    }

    fn handle(&self, def: PipeDef) -> Pipe<'_> {
        Pipe { pipes: self, def }
    }

    /// Looks up a pipe by name.
    pub fn get(&self, name: &str) -> Result<Option<Pipe<'_>>> {
        Ok(self.find_def(name)?.map(|def| self.handle(def)))
    }

    /// Looks up a pipe that must exist.
    ///
    /// # Errors
    ///
    /// `Error::PipeNotFound` if no pipe has this name.
    pub fn pipe(&self, name: &str) -> Result<Pipe<'_>> {
        self.get(name)?.ok_or_else(|| Error::PipeNotFound {
            name: name.to_string(),
        })
    }

    /// Every defined pipe, in definition order.
    pub fn list(&self) -> Result<Vec<PipeDef>> {
        let mut stmt = self
            .connection()
            .prepare(&format!("SELECT {PIPE_COLUMNS} FROM pipes ORDER BY id"))?;
        let defs = stmt
            .query_map([], decode_def)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(defs)
    }

    /// Consumption state of the edge `source → target`.
    pub fn edge_status(&self, source: &str, target: &str) -> Result<EdgeStatus> {
        let source = self.pipe(source)?;
        self.pipe(target)?.status(&source)
    }

    /// Consumption state of every edge that has been used at least once.
    pub fn status(&self) -> Result<Vec<EdgeStatus>> {
        let mut statuses = Vec::new();
        for cursor in cursor::list_all(self.connection())? {
            statuses.extend(self.status_of(&cursor)?);
        }
        Ok(statuses)
    }

    /// `None` for producer cursors, which have no source pipe.
    fn status_of(&self, cursor: &Cursor) -> Result<Option<EdgeStatus>> {
        let Some(source_id) = cursor.source else {
            return Ok(None);
        };
        let (Some(source), Some(target)) = (
            self.find_def_by_id(source_id)?,
            self.find_def_by_id(cursor.target)?,
        ) else {
            return Ok(None);
        };
        Ok(Some(self.handle(target).status(&self.handle(source))?))
    }
}

// =============================================================================
// Pipe Handle
// =============================================================================

/// A handle to one pipe, borrowed from its [`Pipes`] registry.
#[derive(Clone)]
pub struct Pipe<'a> {
    pipes: &'a Pipes,
    def: PipeDef,
}

impl std::fmt::Debug for Pipe<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe").field("def", &self.def).finish()
    }
}

impl<'a> Pipe<'a> {
    /// Pipe name.
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Pipe id.
    pub fn id(&self) -> PipeId {
        self.def.id
    }

    /// Full definition, including the external location if any.
    pub fn def(&self) -> &PipeDef {
        &self.def
    }

    fn conn(&self) -> &'a Connection {
        self.pipes.connection()
    }

    fn window(&self) -> usize {
        self.pipes.config.scan_window
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    /// A bulk writer for this pipe using the registry's thresholds.
    pub fn writer(&self) -> BulkWriter<'a> {
        BulkWriter::new(self.conn(), self.def.clone(), WriterConfig::from(&self.pipes.config))
    }

    /// Appends a sequence of items and makes them durable before returning.
    ///
    /// Returns the id of the last appended record, `None` if `items` was empty.
    pub fn append<I>(&self, items: I) -> Result<Option<RecordId>>
    where
        I: IntoIterator,
        I::Item: Into<Item>,
    {
        let mut writer = self.writer();
        writer.extend(items)?;
        writer.save()?;
        tracing::debug!(pipe = %self.def.name, appended = writer.written(), "append finished");
        Ok(writer.last_written())
    }

    /// Appends one item.
    pub fn append_one(&self, item: impl Into<Item>) -> Result<RecordId> {
        let id = self.append(std::iter::once(item.into()))?;
        id.ok_or_else(|| Error::Schema(format!("append to '{}' wrote no record", self.def.name)))
    }

    // -------------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------------

    /// One record by id.
    pub fn get(&self, id: RecordId) -> Result<Option<Record>> {
        store::get(self.conn(), &self.def, id)
    }

    /// Number of records currently stored.
    pub fn count(&self) -> Result<u64> {
        store::count_after(self.conn(), &self.def, RecordId::ZERO)
    }

    /// Highest id currently stored, `RecordId::ZERO` if empty.
    pub fn max_id(&self) -> Result<RecordId> {
        store::max_id(self.conn(), &self.def)
    }

    /// All records, oldest first.
    pub fn scan(&self) -> Scan<'a> {
        self.scan_after(RecordId::ZERO)
    }

    /// Records with id greater than `after`, oldest first.
    pub fn scan_after(&self, after: RecordId) -> Scan<'a> {
        Scan::new(self.conn(), &self.def, Some(after), Order::Ascending, self.window())
    }

    /// The newest `n` records, newest first. `n == 0` walks the whole pipe.
    pub fn last(&self, n: usize) -> Scan<'a> {
        Scan::new(self.conn(), &self.def, None, Order::Descending, self.window()).with_limit(n)
    }

    /// Records whose key equals `key`, oldest first.
    pub fn find(&self, key: &Value) -> Result<Scan<'a>> {
        self.scan().with_key(key)
    }

    // -------------------------------------------------------------------------
    // Edges
    // -------------------------------------------------------------------------

    /// The cursor of the edge `source → self`, created at offset 0 if new.
    pub fn cursor(&self, source: &Pipe<'_>) -> Result<Cursor> {
        cursor::get_or_create(self.conn(), Some(source.id()), self.id())
    }

    /// Read paths use this so that looking at an edge never creates it.
    fn find_cursor(&self, source: &Pipe<'_>) -> Result<Option<Cursor>> {
        cursor::find(self.conn(), Some(source.id()), self.id())
    }

    fn offset(&self, source: &Pipe<'_>) -> Result<RecordId> {
        Ok(self.find_cursor(source)?.map_or(RecordId::ZERO, |c| c.offset))
    }

    /// Source records this pipe has not consumed yet.
    pub fn backlog(&self, source: &Pipe<'_>) -> Result<Scan<'a>> {
        let offset = self.offset(source)?;
        Ok(Scan::new(self.conn(), source.def(), Some(offset), Order::Ascending, self.window()))
    }

    /// Number of unconsumed source records.
    pub fn backlog_len(&self, source: &Pipe<'_>) -> Result<u64> {
        store::count_after(self.conn(), source.def(), self.offset(source)?)
    }

    /// Whether any source record is past the cursor.
    pub fn has_backlog(&self, source: &Pipe<'_>) -> Result<bool> {
        store::exists_after(self.conn(), source.def(), self.offset(source)?)
    }

    /// Offset, backlog and error count of the edge `source → self`.
    pub fn status(&self, source: &Pipe<'_>) -> Result<EdgeStatus> {
        let (offset, errors) = match self.find_cursor(source)? {
            Some(cursor) => (
                cursor.offset,
                errors_queue::count(self.conn(), cursor.id, source.def())?,
            ),
            None => (RecordId::ZERO, 0),
        };
        Ok(EdgeStatus {
            source: source.name().to_string(),
            target: self.name().to_string(),
            offset,
            backlog: store::count_after(self.conn(), source.def(), offset)?,
            errors,
        })
    }

    /// Status of every edge feeding this pipe, in the order they were first used.
    pub fn inputs(&self) -> Result<Vec<EdgeStatus>> {
        let mut inputs = Vec::new();
        for cursor in cursor::list_for_target(self.conn(), self.id())? {
            inputs.extend(self.pipes.status_of(&cursor)?);
        }
        Ok(inputs)
    }

    // -------------------------------------------------------------------------
    // Processing
    // -------------------------------------------------------------------------

    /// Runs `handler` over the unconsumed records of `source` and appends its
    /// output here.
    ///
    /// Failing records are reported to the edge's error queue and skipped.
    /// The cursor advances only after the output of the records before it is
    /// flushed.
    ///
    /// # Errors
    ///
    /// - `Error::ErrorLimitExceeded` once `opts.error_limit` records failed
    ///   (output so far is flushed first)
    /// - `Error::Interrupted` if the interrupt flag was set or the handler
    ///   returned `HandlerError::Interrupted` (output so far is flushed first)
    /// - Storage errors, immediately; the unflushed tail is processed again
    ///   on the next run
    pub fn call<H>(&self, source: &Pipe<'_>, handler: &mut H, opts: &CallOptions) -> Result<CallReport>
    where
        H: Handler + ?Sized,
    {
        let conn = self.conn();
        let cursor = self.cursor(source)?;

        let pending: Rc<Cell<Option<RecordId>>> = Rc::new(Cell::new(None));
        let mut writer = self.writer();
        {
            let pending = Rc::clone(&pending);
            let cursor_id = cursor.id;
            writer.on_flush(move |conn| {
                if let Some(to) = pending.take() {
                    cursor::advance(conn, cursor_id, to)?;
                }
                Ok(())
            });
        }

        let mut report = CallReport::default();
        let records = Scan::new(conn, source.def(), Some(cursor.offset), Order::Ascending, self.window())
            .with_limit(opts.limit);

        for record in records {
            let record = record?;
            if opts.interrupted() {
                return self.stop_interrupted(source, &mut writer, report);
            }

            match handler.process(&record) {
                Ok(items) => {
                    writer.extend(items)?;
                    report.succeeded += 1;
                }
                Err(HandlerError::Interrupted) => {
                    return self.stop_interrupted(source, &mut writer, report);
                }
                Err(HandlerError::Failed(message)) => {
                    errors_queue::report(conn, cursor.id, record.id, &message)?;
                    report.failed += 1;
                    tracing::warn!(
                        source = %source.name(),
                        target = %self.name(),
                        record = record.id.as_raw(),
                        error = %message,
                        "record quarantined"
                    );
                }
            }
            report.processed += 1;
            pending.set(Some(record.id));

            if opts.error_limit > 0 && report.failed >= opts.error_limit {
                writer.save()?;
                report.written = writer.written();
                tracing::warn!(
                    source = %source.name(),
                    target = %self.name(),
                    errors = report.failed,
                    "error limit exceeded"
                );
                return Err(Error::ErrorLimitExceeded {
                    upstream: source.name().to_string(),
                    downstream: self.name().to_string(),
                    errors: report.failed,
                });
            }
        }

        writer.save()?;
        report.written = writer.written();
        tracing::info!(
            source = %source.name(),
            target = %self.name(),
            processed = report.processed,
            failed = report.failed,
            written = report.written,
            "call finished"
        );
        Ok(report)
    }

    fn stop_interrupted(
        &self,
        source: &Pipe<'_>,
        writer: &mut BulkWriter<'_>,
        report: CallReport,
    ) -> Result<CallReport> {
        writer.save()?;
        tracing::info!(
            source = %source.name(),
            target = %self.name(),
            processed = report.processed,
            written = writer.written(),
            "interrupted"
        );
        Err(Error::Interrupted)
    }

    /// Runs a downloader over the unconsumed records of `source`: a `call`
    /// that appends exactly one item per successful record.
    pub fn download<D>(&self, source: &Pipe<'_>, downloader: &mut D, opts: &CallOptions) -> Result<CallReport>
    where
        D: Download + ?Sized,
    {
        self.call(source, &mut handler::download(downloader), opts)
    }

    /// Re-runs `handler` over the records in the edge's error queue, oldest
    /// failure first.
    ///
    /// A success appends the output and, once it is flushed, removes the
    /// entry. A failure bumps the entry's retry count. The cursor never
    /// moves. Only `opts.interrupt` is honored.
    pub fn retry<H>(&self, source: &Pipe<'_>, handler: &mut H, opts: &CallOptions) -> Result<CallReport>
    where
        H: Handler + ?Sized,
    {
        let conn = self.conn();
        let cursor = self.cursor(source)?;

        let resolved: Rc<RefCell<Vec<RecordId>>> = Rc::new(RefCell::new(Vec::new()));
        let mut writer = self.writer();
        {
            let resolved = Rc::clone(&resolved);
            let cursor_id = cursor.id;
            writer.on_flush(move |conn| {
                for record in resolved.borrow_mut().drain(..) {
                    errors_queue::resolve_record(conn, cursor_id, record)?;
                }
                Ok(())
            });
        }

        let mut report = CallReport::default();
        for entry in ErrorScan::new(conn, cursor.id, source.def(), self.window()) {
            let entry = entry?;
            if opts.interrupted() {
                return self.stop_interrupted(source, &mut writer, report);
            }

            match handler.process(&entry.record) {
                Ok(items) => {
                    writer.extend(items)?;
                    resolved.borrow_mut().push(entry.record.id);
                    report.succeeded += 1;
                }
                Err(HandlerError::Interrupted) => {
                    return self.stop_interrupted(source, &mut writer, report);
                }
                Err(HandlerError::Failed(message)) => {
                    let retries = errors_queue::report(conn, cursor.id, entry.record.id, &message)?;
                    report.failed += 1;
                    tracing::warn!(
                        source = %source.name(),
                        target = %self.name(),
                        record = entry.record.id.as_raw(),
                        retries,
                        error = %message,
                        "retry failed"
                    );
                }
            }
            report.processed += 1;
        }

        writer.save()?;
        report.written = writer.written();
        tracing::info!(
            source = %source.name(),
            target = %self.name(),
            resolved = report.succeeded,
            failed = report.failed,
            "retry finished"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Error Queue
    // -------------------------------------------------------------------------

    /// Entries in the edge's error queue, oldest first.
    ///
    /// Narrow with [`ErrorScan::with_key`] or flip with [`ErrorScan::reversed`].
    pub fn errors(&self, source: &Pipe<'_>) -> Result<ErrorScan<'a>> {
        Ok(match self.find_cursor(source)? {
            Some(cursor) => ErrorScan::new(self.conn(), cursor.id, source.def(), self.window()),
            None => ErrorScan::empty(self.conn(), source.def()),
        })
    }

    /// Number of entries in the edge's error queue whose record still exists.
    pub fn error_count(&self, source: &Pipe<'_>) -> Result<u64> {
        match self.find_cursor(source)? {
            Some(cursor) => errors_queue::count(self.conn(), cursor.id, source.def()),
            None => Ok(0),
        }
    }

    /// Drops entries from the edge's error queue without retrying them,
    /// all of them or only those whose record has `key`.
    pub fn resolve(&self, source: &Pipe<'_>, key: Option<&Value>) -> Result<usize> {
        let Some(cursor) = self.find_cursor(source)? else {
            return Ok(0);
        };
        let resolved = errors_queue::resolve(self.conn(), cursor.id, source.def(), key)?;
        tracing::info!(source = %source.name(), target = %self.name(), resolved, "errors resolved");
        Ok(resolved)
    }

    // -------------------------------------------------------------------------
    // Cursor Moves
    // -------------------------------------------------------------------------

    /// Rewinds the edge so every source record is processed again.
    pub fn reset(&self, source: &Pipe<'_>) -> Result<RecordId> {
        self.move_cursor(source, "reset", |_| Ok(RecordId::ZERO))
    }

    /// Marks the whole current backlog as consumed.
    pub fn skip(&self, source: &Pipe<'_>) -> Result<RecordId> {
        self.move_cursor(source, "skip", |_| store::max_id(self.conn(), source.def()))
    }

    /// Moves the cursor by `n` records: forward for positive `n`, backward
    /// for negative. Clamps to `skip` or `reset` when fewer records exist in
    /// that direction. Returns the new offset.
    pub fn seek(&self, source: &Pipe<'_>, n: i64) -> Result<RecordId> {
        let conn = self.conn();
        self.move_cursor(source, "seek", |offset| {
            if n > 0 {
                match store::nth_after(conn, source.def(), offset, n as u64)? {
                    Some(id) => Ok(id),
                    None => store::max_id(conn, source.def()),
                }
            } else if n < 0 {
                Ok(store::nth_at_or_before(conn, source.def(), offset, n.unsigned_abs())?
                    .unwrap_or(RecordId::ZERO))
            } else {
                Ok(offset)
            }
        })
    }

    fn move_cursor(
        &self,
        source: &Pipe<'_>,
        action: &'static str,
        to: impl FnOnce(RecordId) -> Result<RecordId>,
    ) -> Result<RecordId> {
        let cursor = self.cursor(source)?;
        let offset = to(cursor.offset)?;
        cursor::advance(self.conn(), cursor.id, offset)?;
        tracing::info!(
            source = %source.name(),
            target = %self.name(),
            from = cursor.offset.as_raw(),
            to = offset.as_raw(),
            "cursor {action}"
        );
        Ok(offset)
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Keeps the first record of every key, deletes the rest.
    pub fn dedup(&self) -> Result<usize> {
        let deleted = store::delete_duplicates(self.conn(), &self.def, Keep::First)?;
        tracing::info!(pipe = %self.def.name, deleted, "dedup finished");
        Ok(deleted)
    }

    /// Keeps the last record of every key, deletes the rest.
    pub fn compact(&self) -> Result<usize> {
        let deleted = store::delete_duplicates(self.conn(), &self.def, Keep::Last)?;
        tracing::info!(pipe = %self.def.name, deleted, "compact finished");
        Ok(deleted)
    }

    /// Deletes records older than `max_age`, or every record if `None`.
    ///
    /// Cursors are left alone; offsets past the new maximum just mean there
    /// is nothing left to consume.
    pub fn clean(&self, max_age: Option<Duration>) -> Result<usize> {
        let cutoff = max_age.map(|age| current_time_ms().saturating_sub(age.as_millis() as u64));
        let deleted = store::delete_older_than(self.conn(), &self.def, cutoff)?;
        tracing::info!(pipe = %self.def.name, deleted, "clean finished");
        Ok(deleted)
    }

    /// Compresses every stored value with zstd. Returns records rewritten.
    pub fn compress(&self) -> Result<usize> {
        let rewritten = store::rewrite_values(self.conn(), &self.def, Some(Compression::Zstd), self.window())?;
        tracing::info!(pipe = %self.def.name, rewritten, "compress finished");
        Ok(rewritten)
    }

    /// Stores every value uncompressed again. Returns records rewritten.
    pub fn decompress(&self) -> Result<usize> {
        let rewritten = store::rewrite_values(self.conn(), &self.def, None, self.window())?;
        tracing::info!(pipe = %self.def.name, rewritten, "decompress finished");
        Ok(rewritten)
    }
}

// =============================================================================
// Tests
// =============================================================================

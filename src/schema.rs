//! # SQLite Schema for pipedb
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Schema Overview                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  pipes               records_<pipe id>      (one table per pipe) │
//! │  ┌─────────────┐     ┌──────────────────┐                        │
//! │  │ id (PK)     │────►│ id (PK, AUTOINC) │                        │
//! │  │ name UNIQUE │     │ key_hash, key    │                        │
//! │  │ location    │     │ value BLOB       │                        │
//! │  └─────────────┘     │ created_ms       │                        │
//! │                      │ compression      │                        │
//! │                      └──────────────────┘                        │
//! │                                                                  │
//! │  cursors                      pipe_errors                        │
//! │  ┌──────────────────┐         ┌──────────────────────┐           │
//! │  │ id (PK)          │◄────────│ cursor               │           │
//! │  │ source → pipes   │         │ record → records_<s> │           │
//! │  │ target → pipes   │         │ retries, message     │           │
//! │  │ position         │         │ created_ms,updated_ms│           │
//! │  └──────────────────┘         └──────────────────────┘           │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why one table per pipe?
//!
//! Every pipe is an independent append-only log. A table per pipe gives each
//! log its own `AUTOINCREMENT` sequence (ids increase per pipe, never reused),
//! lets `dedup`/`compact`/`clean` delete without touching other pipes, and
//! lets a pipe's table live in a different database file altogether.
//!
//! ### External pipes
//!
//! A pipe defined with a location keeps its record table in that file. The
//! file is ATTACHed to the main connection as `ext_<pipe id>`, so the rest of
//! the engine addresses it with a qualified table name and nothing else
//! changes. Cursors and error queues always live in the main database.

use std::path::Path;

use rusqlite::Connection;

use crate::types::PipeDef;
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `pipes` table names every defined pipe.
///
/// # Columns
///
/// - `id`: Auto-increment primary key, also names the record table
/// - `name`: Unique pipe name chosen by the user
/// - `location`: Path of an external store, NULL for the main database
/// - `created_ms`: Unix timestamp in milliseconds
const CREATE_PIPES: &str = r#"
CREATE TABLE IF NOT EXISTS pipes (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    location   TEXT,
    created_ms INTEGER NOT NULL
)
"#;

/// The `cursors` table stores one consumption offset per edge.
///
/// # Columns
///
/// - `source`: Pipe being consumed (NULL for a cursor not bound to a source)
/// - `target`: Pipe doing the consuming
/// - `position`: Id of the last source record fully processed
///   (`offset` is an SQL keyword)
const CREATE_CURSORS: &str = r#"
CREATE TABLE IF NOT EXISTS cursors (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    source   INTEGER,
    target   INTEGER NOT NULL,
    position INTEGER NOT NULL DEFAULT 0
)
"#;

/// One cursor per (source, target) pair.
///
/// SQLite treats NULLs as distinct in UNIQUE constraints, so the index is
/// built on `IFNULL(source, 0)`; pipe ids start at 1 and never collide with it.
const CREATE_CURSORS_EDGE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS cursors_edge
ON cursors(IFNULL(source, 0), target)
"#;

/// The `pipe_errors` table is the per-edge error queue.
///
/// # Columns
///
/// - `cursor`: The edge the failure happened on
/// - `record`: Id of the failed record in the source pipe
/// - `retries`: Unsuccessful retries so far (0 after the first failure)
/// - `message`: Latest failure description
/// - `created_ms` / `updated_ms`: First failure and last change
///
/// At most one entry exists per (cursor, record); a renewed failure updates
/// the row in place.
const CREATE_PIPE_ERRORS: &str = r#"
CREATE TABLE IF NOT EXISTS pipe_errors (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    cursor     INTEGER NOT NULL,
    record     INTEGER NOT NULL,
    retries    INTEGER NOT NULL DEFAULT 0,
    message    TEXT NOT NULL,
    created_ms INTEGER NOT NULL,
    updated_ms INTEGER NOT NULL,
    UNIQUE(cursor, record)
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS pipedb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Creates the record table for one pipe.
///
/// # Columns
///
/// - `id`: Log position. `AUTOINCREMENT` guarantees ids are never reused,
///   even after the highest record is deleted by dedup/compact/clean
/// - `key_hash`: XXH3-64 fingerprint of `key`, indexed
/// - `key`: Canonical JSON text of the key
/// - `value`: Serialized value, NULL if absent
/// - `created_ms`: Unix timestamp in milliseconds
/// - `compression`: Codec tag for `value`, NULL if stored plain
pub fn create_record_table(conn: &Connection, def: &PipeDef) -> Result<()> {
    let schema = def.schema();
    let table = def.table();
    let id = def.id.as_raw();
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
             id          INTEGER PRIMARY KEY AUTOINCREMENT,
             key_hash    INTEGER NOT NULL,
             key         TEXT NOT NULL,
             value       BLOB,
             created_ms  INTEGER NOT NULL,
             compression TEXT
         );
         CREATE INDEX IF NOT EXISTS {schema}.records_{id}_key ON records_{id}(key_hash);"
    ))?;
    Ok(())
}

/// Attaches an external pipe's database file under its schema alias.
///
/// The parent directory is created if needed. Attaching an alias that is
/// already attached is a no-op.
pub fn attach_external(conn: &Connection, def: &PipeDef) -> Result<()> {
    let Some(location) = def.location.as_deref() else {
        return Ok(());
    };
    let schema = def.schema();

    let attached: bool = conn.query_row(
        "SELECT COUNT(*) FROM pragma_database_list WHERE name = ?",
        [&schema],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )?;
    if attached {
        return Ok(());
    }

    if let Some(parent) = location.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let path = location
        .to_str()
        .ok_or_else(|| Error::Schema(format!("external path is not UTF-8: {}", location.display())))?;
    conn.execute(&format!("ATTACH DATABASE ?1 AS {schema}"), [path])?;
    Ok(())
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A wrapper around a SQLite connection with the pipedb schema.
///
/// `Database` owns its `Connection`. Dropping it closes the connection (and
/// detaches any external stores).
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use pipedb::Database;
    ///
    /// let db = Database::open("pipes.db")?;
    /// # Ok::<(), pipedb::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// ```rust
    /// use pipedb::Database;
    ///
    /// let db = Database::open_in_memory()?;
    /// # Ok::<(), pipedb::Error>(())
    /// ```
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates all tables and verifies the schema version.
    fn initialize(&mut self) -> Result<()> {
        // WAL: readers (e.g. the status CLI) don't block the pipeline writer.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;

        // Sync the WAL on commit only. A crash can lose the last flush, but
        // never a flush whose cursor update was committed after it.
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_PIPES)?;
        self.conn.execute_batch(CREATE_CURSORS)?;
        self.conn.execute_batch(CREATE_CURSORS_EDGE_INDEX)?;
        self.conn.execute_batch(CREATE_PIPE_ERRORS)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = match self.conn.query_row(
            "SELECT value FROM pipedb_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO pipedb_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this pipedb version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Returns a reference to the underlying SQLite connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the wrapper and returns the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PipeId;

    fn table_count(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )
        .expect("should query tables")
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");

        // metadata, pipes, cursors, pipe_errors
        assert_eq!(table_count(&db.conn), 4);
    }

    #[test]
    fn test_schema_version_stored() {
        let db = Database::open_in_memory().expect("should create db");

        let version: String = db
            .conn
            .query_row(
                "SELECT value FROM pipedb_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .expect("should query version");

        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute(
                    "UPDATE pipedb_metadata SET value = '99' WHERE key = 'schema_version'",
                    [],
                )
                .expect("should update");
        }

        assert!(matches!(Database::open(&path), Err(Error::Schema(_))));
    }

    #[test]
    fn test_double_initialization() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let _db = Database::open(&path).expect("first open should work");
        }

        let db = Database::open(&path).expect("second open should work");
        assert_eq!(table_count(&db.conn), 4);
    }

    #[test]
    fn test_null_source_cursor_is_unique() {
        let db = Database::open_in_memory().expect("should create db");
        db.conn
            .execute("INSERT INTO cursors (source, target) VALUES (NULL, 1)", [])
            .expect("first insert");
        let dup = db
            .conn
            .execute("INSERT INTO cursors (source, target) VALUES (NULL, 1)", []);
        assert!(dup.is_err(), "second NULL-source cursor should be rejected");
    }

    #[test]
    fn test_external_record_table() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let db = Database::open_in_memory().expect("should create db");
        let def = PipeDef {
            id: PipeId::from_raw(7),
            name: "ext".to_string(),
            location: Some(dir.path().join("nested").join("ext.db")),
        };

        attach_external(&db.conn, &def).expect("should attach");
        attach_external(&db.conn, &def).expect("second attach is a no-op");
        create_record_table(&db.conn, &def).expect("should create table");

        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM ext_7.records_7", [], |row| row.get(0))
            .expect("table should exist in attached schema");
        assert_eq!(count, 0);
        assert!(dir.path().join("nested").join("ext.db").exists());
    }
}

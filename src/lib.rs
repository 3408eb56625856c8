//! # pipedb - Incremental Pipeline Engine
//!
//! pipedb is an embedded, replayable data-pipeline engine built on SQLite. It
//! provides:
//!
//! - **Append-only pipes**: named record stores with strictly increasing ids
//! - **Per-edge cursors**: every (source, target) pair remembers how far the
//!   target has consumed the source
//! - **Buffered durable writes**: a bulk writer whose post-flush hook is the
//!   only place a cursor ever moves
//! - **Error quarantine**: failing records go to a per-edge queue that can be
//!   retried or resolved later
//! - **Fixed-point scheduling**: cyclic pipelines run until no watched edge
//!   has backlog
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Runner                               │
//! │          (step list once, then watched steps to fixpoint)       │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Pipes / Pipe                            │
//! │     append · call · retry · dedup · compact · reset/skip/seek   │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────┐  ┌───────────┐ │
//! │  │ Bulk Writer │  │   Cursors   │  │  Error   │  │  Record   │ │
//! │  │ + flush hook│  │ (per edge)  │  │  Queue   │  │  Store    │ │
//! │  └─────────────┘  └─────────────┘  └──────────┘  └───────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           SQLite                                │
//! │           (main database + attached external stores)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Ids never move**: record ids strictly increase within a pipe and are
//!    never reused or renumbered, even after deletes
//! 2. **Cursor never leads disk**: an edge's offset only passes a record after
//!    that record's output has been flushed
//! 3. **One entry per failure**: at most one error-queue entry per (edge, record)
//! 4. **Single writer per edge**: callers do not run the same edge concurrently
//!
//! ## Module Organization
//!
//! - [`error`]: Error types for all failure modes
//! - [`config`]: Engine configuration (YAML + environment)
//! - [`schema`]: SQLite DDL and database initialization
//! - [`types`]: Domain types (PipeId, RecordId, Record, Item, ...)
//! - [`codec`]: Key/value serialization, fingerprints, compression
//! - [`store`]: Record store and windowed scans
//! - [`writer`]: Bulk writer with post-flush hook
//! - [`cursor`]: Per-edge cursor registry
//! - [`errors_queue`]: Per-edge error queue
//! - [`handler`]: Handler/Download capabilities and decorators
//! - [`pipe`]: Pipe registry and operations (main entry point)
//! - [`runner`]: Fixed-point scheduler

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for pipedb operations.
///
/// One enum for everything that stops an operation, and a separate
/// [`HandlerError`](error::HandlerError) for per-record handler failures.
pub mod error;

/// Engine configuration.
///
/// Defaults, YAML loading with `${VAR}` substitution, and `PIPEDB_*`
/// environment overrides.
pub mod config;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Domain types: identifiers, records, cursors and error entries.
///
/// Uses the newtype pattern so ids of different tables can't be mixed up.
pub mod types;

/// Key and value encoding.
///
/// Canonical JSON keys with an XXH3 fingerprint, JSON values with optional
/// zstd compression.
pub mod codec;

/// The append-only record table behind every pipe.
pub mod store;

/// Bulk writer with size/age thresholds and a post-flush hook.
pub mod writer;

/// Per-edge consumption cursors.
pub mod cursor;

/// Per-edge error queue: report, list, resolve.
pub mod errors_queue;

/// Handler and Download capabilities, closure adapters and decorators.
pub mod handler;

/// The pipe registry and every pipe operation.
///
/// The main entry point is [`Pipes`](pipe::Pipes).
pub mod pipe;

/// Scheduler that drives a step list, then watched steps to a fixed point.
pub mod runner;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::EngineConfig;
pub use error::{Error, HandlerError, Result};
pub use handler::{Download, Handler};
pub use pipe::{CallOptions, CallReport, Interrupt, Pipe, Pipes};
pub use runner::{RunReport, Runner, Step};
pub use schema::Database;
pub use writer::{BulkWriter, WriterConfig};

pub use types::{EdgeStatus, ErrorEntry, Item, PipeId, Record, RecordId};

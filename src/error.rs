//! # Error Handling for pipedb
//!
//! This module defines the error types used throughout pipedb. There are two
//! of them, and the split is deliberate:
//!
//! - [`Error`]: everything that stops an operation. Storage failures, schema
//!   problems, a blown error limit, an interrupt.
//! - [`HandlerError`]: what a user-supplied transformation returns when it
//!   cannot process one record. These never escape `call`/`retry` on their
//!   own; they are quarantined into the error queue.
//!
//! ## Error Categories
//!
//! | Category      | Examples                         | Typical Response                  |
//! |---------------|----------------------------------|-----------------------------------|
//! | Per-record    | `HandlerError::Failed`           | Queued, run continues             |
//! | Escalation    | `Error::ErrorLimitExceeded`      | Stop the pipeline, investigate    |
//! | Cancellation  | `Error::Interrupted`             | Buffer already flushed, rerun     |
//! | Internal      | SQLite error, I/O error          | Propagate, nothing is retried     |
//! | Usage         | `PipeExists`, `PipeNotFound`     | Fix the caller                    |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can stop a pipedb operation.
///
/// # Example
///
/// ```rust
/// use pipedb::{Error, Pipes};
///
/// let pipes = Pipes::open_in_memory()?;
/// pipes.define("raw")?;
/// assert!(matches!(pipes.define("raw"), Err(Error::PipeExists { .. })));
/// # Ok::<(), pipedb::Error>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Usage Errors
    // =========================================================================

    /// A pipe with this name is already defined.
    ///
    /// Pipe names are unique within a database. Defining is explicit and
    /// happens once; use [`Pipes::pipe`](crate::Pipes::pipe) to get a handle
    /// to an existing pipe.
    #[error("pipe '{name}' is already defined")]
    PipeExists {
        /// The name that was defined twice
        name: String,
    },

    /// No pipe with this name exists.
    #[error("pipe '{name}' is not defined")]
    PipeNotFound {
        /// The name that was looked up
        name: String,
    },

    // =========================================================================
    // Escalation and Cancellation
    // =========================================================================

    /// Too many records failed during a single `call`.
    ///
    /// # When This Happens
    ///
    /// `CallOptions::error_limit` is non-zero and that many handler failures
    /// have been quarantined in the current invocation. Everything processed
    /// so far is flushed and the cursor reflects it; the remaining backlog is
    /// left for the next run.
    ///
    /// # Recovery
    ///
    /// Inspect the error queue for the edge, fix the handler or the data,
    /// then `retry` and run again.
    #[error("error limit exceeded on '{upstream}' -> '{downstream}': {errors} failed records")]
    ErrorLimitExceeded {
        /// Name of the source pipe
        upstream: String,
        /// Name of the target pipe
        downstream: String,
        /// Failures counted in this invocation
        errors: usize,
    },

    /// Processing was interrupted on request.
    ///
    /// Raised only after the bulk writer has been flushed, so every record
    /// the cursor has moved past has its output on disk.
    #[error("interrupted")]
    Interrupted,

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// The `#[from]` attribute lets `?` convert `rusqlite::Error` directly.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corrupted row detected.
    #[error("schema error: {0}")]
    Schema(String),

    /// A key or value could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// zstd compression or decompression of a value failed.
    #[error("compression error: {0}")]
    Compression(#[source] std::io::Error),

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Filesystem error outside SQLite (e.g. creating a directory).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Handler Errors
// =============================================================================

/// Failure signalled by a [`Handler`](crate::handler::Handler) for one record.
///
/// `Failed` is the normal case: the message is stored in the error queue and
/// the run moves on. `Interrupted` asks the engine to stop, the same way an
/// [`Interrupt`](crate::pipe::Interrupt) flag does.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The record could not be processed.
    #[error("{0}")]
    Failed(String),

    /// The handler wants the whole run to stop.
    #[error("interrupted by handler")]
    Interrupted,
}

impl HandlerError {
    /// Builds a `Failed` error from anything printable.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::failed(err)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages show up in logs and the error queue, keep them readable.
    #[test]
    fn test_error_display() {
        let exists = Error::PipeExists {
            name: "raw".to_string(),
        };
        assert_eq!(exists.to_string(), "pipe 'raw' is already defined");

        let limit = Error::ErrorLimitExceeded {
            upstream: "pages".to_string(),
            downstream: "items".to_string(),
            errors: 3,
        };
        assert_eq!(
            limit.to_string(),
            "error limit exceeded on 'pages' -> 'items': 3 failed records"
        );

        assert_eq!(Error::Interrupted.to_string(), "interrupted");
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }

    #[test]
    fn test_handler_error_from_str() {
        let err: HandlerError = "bad row".into();
        assert_eq!(err, HandlerError::Failed("bad row".to_string()));
        assert_eq!(err.to_string(), "bad row");
    }
}

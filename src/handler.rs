//! # Handlers
//!
//! The engine never knows what a transformation does. It only needs two
//! capabilities:
//!
//! - [`Handler`]: one record in, zero or more items out (used by `call` and
//!   `retry`)
//! - [`Download`]: one record in, exactly one item out (used by `download`)
//!
//! ## Rust Pattern: Decorators as Wrapper Types
//!
//! Wrapping a handler is just another type implementing the same trait and
//! delegating to the one inside it:
//!
//! ```text
//! traced(download(fetch_fn(|record| ...)))
//!   │        │         └─ Download from a closure
//!   │        └─ Download → Handler (one item per record)
//!   └─ Handler → Handler (adds a tracing span per record)
//! ```
//!
//! Closures become handlers through [`from_fn`] / [`fetch_fn`] rather than a
//! blanket impl on `FnMut`. That keeps the signature visible to type
//! inference at the call site and leaves room for the `&mut H` and `Box<H>`
//! forwarding impls below.

use crate::error::HandlerError;
use crate::types::{Item, Record};

// =============================================================================
// Capability Traits
// =============================================================================

/// Transforms one record into zero or more output items.
///
/// Returning `Err(HandlerError::Failed(_))` quarantines the record; the run
/// continues with the next one. Returning `Err(HandlerError::Interrupted)`
/// stops the run after the buffered output is flushed.
pub trait Handler {
    /// Processes one source record.
    fn process(&mut self, record: &Record) -> Result<Vec<Item>, HandlerError>;
}

/// Fetches exactly one item for a record (e.g. downloads the page it names).
pub trait Download {
    /// Produces the item for one source record.
    fn fetch(&mut self, record: &Record) -> Result<Item, HandlerError>;
}

impl<H: Handler + ?Sized> Handler for &mut H {
    fn process(&mut self, record: &Record) -> Result<Vec<Item>, HandlerError> {
        (**self).process(record)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn process(&mut self, record: &Record) -> Result<Vec<Item>, HandlerError> {
        (**self).process(record)
    }
}

impl<D: Download + ?Sized> Download for &mut D {
    fn fetch(&mut self, record: &Record) -> Result<Item, HandlerError> {
        (**self).fetch(record)
    }
}

impl<D: Download + ?Sized> Download for Box<D> {
    fn fetch(&mut self, record: &Record) -> Result<Item, HandlerError> {
        (**self).fetch(record)
    }
}

// =============================================================================
// Closure Adapters
// =============================================================================

/// A [`Handler`] backed by a closure. See [`from_fn`].
#[derive(Clone)]
pub struct FromFn<F>(F);

/// Turns a closure into a [`Handler`].
///
/// ```rust
/// use pipedb::handler::{from_fn, Handler};
/// use pipedb::types::{Item, Record, RecordId};
/// use serde_json::json;
///
/// let mut double = from_fn(|record: &Record| {
///     let n = record.key.as_i64().unwrap_or(0);
///     Ok(vec![Item::key_only(n * 2)])
/// });
///
/// let record = Record {
///     id: RecordId::from_raw(1),
///     key: json!(21),
///     value: None,
///     created_ms: 0,
///     compression: None,
/// };
/// assert_eq!(double.process(&record).unwrap()[0].key, json!(42));
/// ```
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: FnMut(&Record) -> Result<Vec<Item>, HandlerError>,
{
    FromFn(f)
}

impl<F> Handler for FromFn<F>
where
    F: FnMut(&Record) -> Result<Vec<Item>, HandlerError>,
{
    fn process(&mut self, record: &Record) -> Result<Vec<Item>, HandlerError> {
        (self.0)(record)
    }
}

/// A [`Download`] backed by a closure. See [`fetch_fn`].
#[derive(Clone)]
pub struct FetchFn<F>(F);

/// Turns a closure into a [`Download`].
pub fn fetch_fn<F>(f: F) -> FetchFn<F>
where
    F: FnMut(&Record) -> Result<Item, HandlerError>,
{
    FetchFn(f)
}

impl<F> Download for FetchFn<F>
where
    F: FnMut(&Record) -> Result<Item, HandlerError>,
{
    fn fetch(&mut self, record: &Record) -> Result<Item, HandlerError> {
        (self.0)(record)
    }
}

// =============================================================================
// Decorators
// =============================================================================

/// Adapts a [`Download`] into a single-item [`Handler`]. See [`download`].
pub struct Downloading<D>(D);

/// Wraps a downloader so it can be driven by `call`.
pub fn download<D: Download>(downloader: D) -> Downloading<D> {
    Downloading(downloader)
}

impl<D: Download> Handler for Downloading<D> {
    fn process(&mut self, record: &Record) -> Result<Vec<Item>, HandlerError> {
        Ok(vec![self.0.fetch(record)?])
    }
}

/// A handler that emits at most one item and never fails. See [`filter_map`].
pub struct FilterMap<F>(F);

/// Builds a handler from an `Option`-returning function: `Some(item)` emits
/// the item, `None` drops the record.
pub fn filter_map<F>(f: F) -> FilterMap<F>
where
    F: FnMut(&Record) -> Option<Item>,
{
    FilterMap(f)
}

impl<F> Handler for FilterMap<F>
where
    F: FnMut(&Record) -> Option<Item>,
{
    fn process(&mut self, record: &Record) -> Result<Vec<Item>, HandlerError> {
        Ok((self.0)(record).into_iter().collect())
    }
}

/// Runs the inner handler inside a per-record `tracing` span. See [`traced`].
pub struct Traced<H> {
    inner: H,
    name: &'static str,
}

/// Wraps a handler with a `debug` span per record and a log line per outcome.
pub fn traced<H: Handler>(name: &'static str, inner: H) -> Traced<H> {
    Traced { inner, name }
}

impl<H: Handler> Handler for Traced<H> {
    fn process(&mut self, record: &Record) -> Result<Vec<Item>, HandlerError> {
        let span = tracing::debug_span!("handler", name = self.name, record = record.id.as_raw());
        let _enter = span.enter();

        let result = self.inner.process(record);
        match &result {
            Ok(items) => tracing::debug!(outputs = items.len(), "record processed"),
            Err(e) => tracing::debug!(error = %e, "record failed"),
        }
        result
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordId;
    use serde_json::json;

    fn record(key: serde_json::Value) -> Record {
        Record {
            id: RecordId::from_raw(7),
            key,
            value: None,
            created_ms: 0,
            compression: None,
        }
    }

    #[test]
    fn test_from_fn_keeps_state() {
        let mut seen = 0;
        {
            let mut counter = from_fn(|_: &Record| {
                seen += 1;
                Ok(Vec::new())
            });
            counter.process(&record(json!(1))).unwrap();
            counter.process(&record(json!(2))).unwrap();
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_download_emits_one_item() {
        let mut handler = download(fetch_fn(|r: &Record| Ok(Item::new(r.key.clone(), json!("body")))));
        let items = handler.process(&record(json!("url"))).unwrap();
        assert_eq!(items, vec![Item::new("url", json!("body"))]);
    }

    #[test]
    fn test_download_failure_passes_through() {
        let mut handler = download(fetch_fn(|_: &Record| Err(HandlerError::failed("404"))));
        assert_eq!(
            handler.process(&record(json!("url"))),
            Err(HandlerError::Failed("404".to_string()))
        );
    }

    #[test]
    fn test_filter_map() {
        let mut evens = filter_map(|r: &Record| {
            let n = r.key.as_i64()?;
            (n % 2 == 0).then(|| Item::key_only(n))
        });
        assert_eq!(evens.process(&record(json!(4))).unwrap().len(), 1);
        assert!(evens.process(&record(json!(3))).unwrap().is_empty());
        assert!(evens.process(&record(json!("x"))).unwrap().is_empty());
    }

    #[test]
    fn test_traced_and_boxed_delegate() {
        let inner = from_fn(|r: &Record| Ok(vec![Item::key_only(r.key.clone())]));
        let mut boxed: Box<dyn Handler> = Box::new(traced("echo", inner));
        let items = boxed.process(&record(json!("k"))).unwrap();
        assert_eq!(items[0].key, json!("k"));
    }
}

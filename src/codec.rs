//! # Key and Value Encoding
//!
//! This module turns keys and values into the bytes stored in a pipe's record
//! table, and back.
//!
//! ## Storage Format
//!
//! ```text
//! key         → JSON text            (column `key`)
//! fingerprint → XXH3-64(key JSON)    (column `key_hash`, indexed)
//! value       → JSON bytes           (column `value`, NULL if absent)
//!             → zstd(JSON bytes)     (when `compression` = 'zstd')
//! ```
//!
//! ## Why Fingerprint Keys?
//!
//! Keys are arbitrary JSON: a string, a number, a nested array. Indexing the
//! text directly would make the B-tree as wide as the widest key. The 8-byte
//! fingerprint keeps the index narrow; the full text is still compared when
//! grouping so two keys that happen to share a fingerprint stay distinct.
//!
//! `serde_json` stores object members in sorted order, so equal keys always
//! serialize to the same text and therefore the same fingerprint.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::Compression;

/// zstd level used by `compress()` (1 = fastest).
pub const ZSTD_LEVEL: i32 = 1;

// =============================================================================
// Keys
// =============================================================================

/// Serializes a key to its stored text form.
pub fn encode_key(key: &Value) -> Result<String> {
    Ok(serde_json::to_string(key)?)
}

/// Parses a stored key.
pub fn decode_key(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}

/// Computes the fixed-width fingerprint of an encoded key.
///
/// XXH3-64 is formally specified, so the same key produces the same
/// fingerprint on every platform and version. The `u64` is reinterpreted as
/// `i64` for SQLite INTEGER storage.
pub fn fingerprint(encoded_key: &str) -> i64 {
    xxhash_rust::xxh3::xxh3_64(encoded_key.as_bytes()) as i64
}

// =============================================================================
// Values
// =============================================================================

/// Serializes an optional value, compressing it if asked to.
pub fn encode_value(value: Option<&Value>, compression: Option<Compression>) -> Result<Option<Vec<u8>>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let bytes = serde_json::to_vec(value)?;
    match compression {
        None => Ok(Some(bytes)),
        Some(Compression::Zstd) => Ok(Some(compress(&bytes)?)),
    }
}

/// Parses a stored value blob according to its compression tag.
pub fn decode_value(blob: Option<&[u8]>, compression: Option<Compression>) -> Result<Option<Value>> {
    let Some(blob) = blob else {
        return Ok(None);
    };
    let value = match compression {
        None => serde_json::from_slice(blob)?,
        Some(Compression::Zstd) => serde_json::from_slice(&decompress(blob)?)?,
    };
    Ok(Some(value))
}

/// Compresses raw bytes with zstd.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(bytes, ZSTD_LEVEL).map_err(Error::Compression)
}

/// Decompresses a zstd frame.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(bytes).map_err(Error::Compression)
}

/// Parses the `compression` column.
pub fn decode_compression(tag: Option<&str>) -> Result<Option<Compression>> {
    match tag {
        None => Ok(None),
        Some(tag) => Compression::from_tag(tag)
            .map(Some)
            .ok_or_else(|| Error::Schema(format!("unknown compression tag '{tag}'"))),
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_encoding_is_canonical() {
        let a = encode_key(&json!({"b": 1, "a": 2})).unwrap();
        let b = encode_key(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_differs_by_type() {
        // The number 1 and the string "1" are different keys.
        let number = encode_key(&json!(1)).unwrap();
        let string = encode_key(&json!("1")).unwrap();
        assert_ne!(fingerprint(&number), fingerprint(&string));
    }

    #[test]
    fn test_compressed_value_reads_back() {
        let value = json!({"body": "x".repeat(4096)});
        let plain = encode_value(Some(&value), None).unwrap().unwrap();
        let packed = encode_value(Some(&value), Some(Compression::Zstd)).unwrap().unwrap();

        assert!(packed.len() < plain.len());
        assert_eq!(
            decode_value(Some(&packed), Some(Compression::Zstd)).unwrap(),
            Some(value)
        );
    }

    #[test]
    fn test_absent_value_stays_absent() {
        assert_eq!(encode_value(None, Some(Compression::Zstd)).unwrap(), None);
        assert_eq!(decode_value(None, None).unwrap(), None);
    }

    #[test]
    fn test_unknown_compression_tag_is_schema_error() {
        assert!(matches!(decode_compression(Some("brotli")), Err(Error::Schema(_))));
        assert_eq!(decode_compression(None).unwrap(), None);
    }
}

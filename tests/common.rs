#![allow(dead_code)]

use std::path::{Path, PathBuf};

use pipedb::handler::{from_fn, FromFn};
use pipedb::types::{Item, Record};
use pipedb::{EngineConfig, HandlerError, Pipe, Pipes};
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Pipes::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

/// A config whose writer flushes every `bytes` encoded bytes.
pub fn config_with_buffer_bytes(bytes: usize) -> EngineConfig {
    EngineConfig {
        buffer_bytes: bytes,
        ..EngineConfig::default()
    }
}

/// Keys of every record in the pipe, in id order.
pub fn keys(pipe: &Pipe<'_>) -> Vec<Value> {
    pipe.scan()
        .map(|r| r.expect("scan record").key)
        .collect()
}

/// Raw ids of every record in the pipe, in id order.
pub fn ids(pipe: &Pipe<'_>) -> Vec<i64> {
    pipe.scan()
        .map(|r| r.expect("scan record").id.as_raw())
        .collect()
}

type HandlerFn = fn(&Record) -> Result<Vec<Item>, HandlerError>;

/// Emits the record's key unchanged.
pub fn echo() -> FromFn<HandlerFn> {
    let f: HandlerFn = |r| Ok(vec![Item::key_only(r.key.clone())]);
    from_fn(f)
}

/// Emits `key * 2` while the key is below 16, nothing after.
pub fn double_below_16() -> FromFn<HandlerFn> {
    let f: HandlerFn = |r| {
        let k = r.key.as_i64().ok_or("key is not an integer")?;
        Ok(if k < 16 {
            vec![Item::key_only(k * 2)]
        } else {
            Vec::new()
        })
    };
    from_fn(f)
}

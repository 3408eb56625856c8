mod common;

use pipedb::handler::from_fn;
use pipedb::types::{Item, Record, RecordId};
use pipedb::{CallOptions, Error, HandlerError, Pipes};
use serde_json::json;

#[test]
fn restart_keeps_pipes_cursors_and_errors() {
    let (_dir, path) = common::create_temp_db_file("restart.db");

    {
        let pipes = Pipes::open(&path).unwrap();
        let src = pipes.define("src").unwrap();
        let dst = pipes.define("dst").unwrap();
        src.append((1..=5).map(|i| json!(i))).unwrap();

        let mut handler = from_fn(|r: &Record| {
            if r.key == json!(2) {
                return Err(HandlerError::failed("flaky"));
            }
            Ok(vec![Item::key_only(r.key.clone())])
        });
        dst.call(&src, &mut handler, &CallOptions::default().with_limit(3))
            .unwrap();
    }

    // Second registry instance (simulates process restart).
    let pipes = Pipes::open(&path).unwrap();
    let src = pipes.pipe("src").unwrap();
    let dst = pipes.pipe("dst").unwrap();

    assert_eq!(dst.cursor(&src).unwrap().offset, RecordId::from_raw(3));
    assert_eq!(dst.backlog_len(&src).unwrap(), 2);
    assert_eq!(dst.error_count(&src).unwrap(), 1);
    assert!(matches!(pipes.define("src"), Err(Error::PipeExists { .. })));

    // Ids keep increasing across the restart.
    assert_eq!(src.append_one(json!(6)).unwrap(), RecordId::from_raw(6));
}

#[test]
fn external_pipe_is_reattached_on_open() {
    let (dir, path) = common::create_temp_db_file("main.db");
    let external = dir.path().join("stores").join("pages.db");

    {
        let pipes = Pipes::open(&path).unwrap();
        let pages = pipes.define_external("pages", &external).unwrap();
        assert!(pages.def().is_external());
        pages.append([json!("/a"), json!("/b")]).unwrap();
    }
    assert!(external.exists());

    let pipes = Pipes::open(&path).unwrap();
    let pages = pipes.pipe("pages").unwrap();
    assert_eq!(pages.def().location.as_deref(), Some(external.as_path()));
    assert_eq!(common::keys(&pages), vec![json!("/a"), json!("/b")]);

    // The records really live in the other file.
    let conn = common::open_read_only(&external);
    let table = format!("records_{}", pages.id());
    let rows: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 2);
}

#[test]
fn errors_from_an_external_source_are_listed() {
    let (dir, path) = common::create_temp_db_file("main.db");
    let pipes = Pipes::open(&path).unwrap();
    let pages = pipes
        .define_external("pages", dir.path().join("pages.db"))
        .unwrap();
    let items = pipes.define("items").unwrap();
    pages
        .append([
            Item::new("/a", json!("ok")),
            Item::new("/b", json!("broken")),
            Item::new("/c", json!("broken")),
        ])
        .unwrap();

    let mut parse = from_fn(|r: &Record| match r.value.as_ref().and_then(|v| v.as_str()) {
        Some("ok") => Ok(vec![Item::key_only(r.key.clone())]),
        _ => Err(HandlerError::failed("unparseable page")),
    });
    let report = items.call(&pages, &mut parse, &CallOptions::default()).unwrap();
    assert_eq!(report.failed, 2);

    let failed: Vec<_> = items
        .errors(&pages)
        .unwrap()
        .map(|e| e.unwrap().record.key)
        .collect();
    assert_eq!(failed, vec![json!("/b"), json!("/c")]);

    let only_c: Vec<_> = items
        .errors(&pages)
        .unwrap()
        .with_key(&json!("/c"))
        .unwrap()
        .map(|e| e.unwrap().record.id)
        .collect();
    assert_eq!(only_c, vec![RecordId::from_raw(3)]);

    assert_eq!(items.resolve(&pages, Some(&json!("/b"))).unwrap(), 1);
    assert_eq!(items.error_count(&pages).unwrap(), 1);

    // Entries whose page was cleaned out are neither listed nor counted.
    pages.clean(None).unwrap();
    assert_eq!(items.errors(&pages).unwrap().count(), 0);
    assert_eq!(items.error_count(&pages).unwrap(), 0);
}

#[test]
fn registry_lists_pipes_in_definition_order() {
    let pipes = Pipes::open_in_memory().unwrap();
    for name in ["raw", "clean", "out"] {
        pipes.define(name).unwrap();
    }

    let names: Vec<String> = pipes.list().unwrap().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["raw", "clean", "out"]);
    assert!(pipes.get("missing").unwrap().is_none());
    assert!(matches!(pipes.pipe("missing"), Err(Error::PipeNotFound { .. })));
}

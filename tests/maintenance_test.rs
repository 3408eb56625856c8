mod common;

use std::time::Duration;

use pipedb::types::{Compression, Item, RecordId};
use pipedb::Pipes;
use serde_json::json;

fn seeded() -> Pipes {
    let pipes = Pipes::open_in_memory().unwrap();
    let p = pipes.define("p").unwrap();
    p.append([
        Item::new(1, json!("a")),
        Item::new(1, json!("b")),
        Item::new(2, json!("c")),
        Item::new(1, json!("d")),
        Item::new(1, json!("e")),
    ])
    .unwrap();
    pipes
}

#[test]
fn dedup_keeps_first_occurrence_and_is_idempotent() {
    let pipes = seeded();
    let p = pipes.pipe("p").unwrap();

    assert_eq!(p.dedup().unwrap(), 3);
    assert_eq!(common::keys(&p), vec![json!(1), json!(2)]);
    assert_eq!(common::ids(&p), vec![1, 3]);

    assert_eq!(p.dedup().unwrap(), 0);
    assert_eq!(common::ids(&p), vec![1, 3]);
}

#[test]
fn compact_keeps_last_write_per_key() {
    let pipes = seeded();
    let p = pipes.pipe("p").unwrap();

    assert_eq!(p.compact().unwrap(), 3);
    assert_eq!(common::keys(&p), vec![json!(2), json!(1)]);

    let values: Vec<_> = p.scan().map(|r| r.unwrap().value).collect();
    assert_eq!(values, vec![Some(json!("c")), Some(json!("e"))]);
}

#[test]
fn dedup_distinguishes_keys_by_type() {
    let pipes = Pipes::open_in_memory().unwrap();
    let p = pipes.define("p").unwrap();
    p.append([json!(1), json!("1"), json!([1]), json!(1)]).unwrap();

    assert_eq!(p.dedup().unwrap(), 1);
    assert_eq!(common::ids(&p), vec![1, 2, 3]);
}

#[test]
fn new_ids_continue_after_deleting_the_newest() {
    let pipes = seeded();
    let p = pipes.pipe("p").unwrap();
    p.dedup().unwrap();

    // Id 5 was deleted; the next record still gets 6.
    let id = p.append_one(json!(3)).unwrap();
    assert_eq!(id, RecordId::from_raw(6));
}

#[test]
fn clean_by_age_and_entirely() {
    let pipes = seeded();
    let p = pipes.pipe("p").unwrap();

    // Everything was just written, so nothing is a day old.
    assert_eq!(p.clean(Some(Duration::from_secs(86_400))).unwrap(), 0);
    assert_eq!(p.count().unwrap(), 5);

    assert_eq!(p.clean(None).unwrap(), 5);
    assert_eq!(p.count().unwrap(), 0);
    assert_eq!(p.max_id().unwrap(), RecordId::ZERO);
}

#[test]
fn cursor_past_deleted_records_means_no_backlog() {
    let pipes = seeded();
    let p = pipes.pipe("p").unwrap();
    let out = pipes.define("out").unwrap();

    out.skip(&p).unwrap();
    p.clean(None).unwrap();
    assert_eq!(out.cursor(&p).unwrap().offset, RecordId::from_raw(5));
    assert_eq!(out.backlog_len(&p).unwrap(), 0);

    p.append_one(json!("fresh")).unwrap();
    assert_eq!(out.backlog_len(&p).unwrap(), 1);
}

#[test]
fn compress_is_transparent_to_readers() {
    let pipes = seeded();
    let p = pipes.pipe("p").unwrap();
    p.append_one(json!("no value")).unwrap();
    let before: Vec<_> = p.scan().map(|r| r.unwrap().into_item()).collect();

    // Five records have values; the key-only one is left alone.
    assert_eq!(p.compress().unwrap(), 5);
    let record = p.get(RecordId::from_raw(1)).unwrap().unwrap();
    assert_eq!(record.compression, Some(Compression::Zstd));

    let after: Vec<_> = p.scan().map(|r| r.unwrap().into_item()).collect();
    assert_eq!(before, after);

    assert_eq!(p.decompress().unwrap(), 5);
    assert_eq!(p.get(RecordId::from_raw(1)).unwrap().unwrap().compression, None);
}

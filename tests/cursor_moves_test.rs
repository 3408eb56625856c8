mod common;

use pipedb::types::RecordId;
use pipedb::Pipes;
use serde_json::json;

fn backlog_ids(pipes: &Pipes) -> Vec<i64> {
    let src = pipes.pipe("src").unwrap();
    let dst = pipes.pipe("dst").unwrap();
    dst.backlog(&src)
        .unwrap()
        .map(|r| r.unwrap().id.as_raw())
        .collect()
}

fn five_records() -> Pipes {
    let pipes = Pipes::open_in_memory().unwrap();
    let src = pipes.define("src").unwrap();
    pipes.define("dst").unwrap();
    src.append((1..=5).map(|i| json!(i))).unwrap();
    pipes
}

#[test]
fn seek_forward_counts_records() {
    let pipes = five_records();
    let src = pipes.pipe("src").unwrap();
    let dst = pipes.pipe("dst").unwrap();

    assert_eq!(dst.seek(&src, 3).unwrap(), RecordId::from_raw(3));
    assert_eq!(backlog_ids(&pipes), vec![4, 5]);
}

#[test]
fn seek_clamps_to_reset_and_skip() {
    let pipes = five_records();
    let src = pipes.pipe("src").unwrap();
    let dst = pipes.pipe("dst").unwrap();

    dst.seek(&src, 2).unwrap();
    assert_eq!(dst.seek(&src, -10).unwrap(), RecordId::ZERO);
    assert_eq!(backlog_ids(&pipes), vec![1, 2, 3, 4, 5]);

    assert_eq!(dst.seek(&src, 10).unwrap(), RecordId::from_raw(5));
    assert!(backlog_ids(&pipes).is_empty());
}

#[test]
fn seek_by_extreme_counts_clamps() {
    let pipes = five_records();
    let src = pipes.pipe("src").unwrap();
    let dst = pipes.pipe("dst").unwrap();

    dst.skip(&src).unwrap();
    assert_eq!(dst.seek(&src, i64::MIN).unwrap(), RecordId::ZERO);
    assert_eq!(backlog_ids(&pipes), vec![1, 2, 3, 4, 5]);

    assert_eq!(dst.seek(&src, i64::MAX).unwrap(), RecordId::from_raw(5));
    assert!(backlog_ids(&pipes).is_empty());

    dst.seek(&src, -2).unwrap();
    assert_eq!(dst.seek(&src, i64::MIN + 1).unwrap(), RecordId::ZERO);
}

#[test]
fn seek_backward_reexposes_records() {
    let pipes = five_records();
    let src = pipes.pipe("src").unwrap();
    let dst = pipes.pipe("dst").unwrap();

    dst.skip(&src).unwrap();
    dst.seek(&src, -2).unwrap();
    assert_eq!(backlog_ids(&pipes), vec![4, 5]);

    dst.seek(&src, 0).unwrap();
    assert_eq!(backlog_ids(&pipes), vec![4, 5]);
}

#[test]
fn seek_counts_records_not_id_distance() {
    let pipes = Pipes::open_in_memory().unwrap();
    let src = pipes.define("src").unwrap();
    pipes.define("dst").unwrap();
    src.append([json!("a"), json!("a"), json!("b"), json!("a"), json!("c")]).unwrap();
    src.dedup().unwrap(); // survivors: 1, 3, 5

    let dst = pipes.pipe("dst").unwrap();
    assert_eq!(dst.seek(&src, 2).unwrap(), RecordId::from_raw(3));
    assert_eq!(backlog_ids(&pipes), vec![5]);

    assert_eq!(dst.seek(&src, -1).unwrap(), RecordId::from_raw(1));
    assert_eq!(backlog_ids(&pipes), vec![3, 5]);
}

#[test]
fn reset_replays_and_skip_consumes() {
    let pipes = five_records();
    let src = pipes.pipe("src").unwrap();
    let dst = pipes.pipe("dst").unwrap();

    assert_eq!(dst.skip(&src).unwrap(), RecordId::from_raw(5));
    assert_eq!(dst.backlog_len(&src).unwrap(), 0);

    src.append_one(json!(6)).unwrap();
    assert_eq!(backlog_ids(&pipes), vec![6]);

    assert_eq!(dst.reset(&src).unwrap(), RecordId::ZERO);
    assert_eq!(dst.backlog_len(&src).unwrap(), 6);
}

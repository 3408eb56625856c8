mod common;

use pipedb::runner::{Outcome, Runner, Step};
use pipedb::{EngineConfig, Pipes};
use serde_json::json;

/// Two steps feed each other: `b` doubles what lands in `a`, `a` doubles what
/// lands in `b`, both stop at 16. The watch loop has to run until neither
/// side has backlog, then stop on its own.
#[test]
fn mutually_watching_steps_reach_a_fixed_point() {
    let pipes = Pipes::open_in_memory().unwrap();
    pipes.define("a").unwrap();
    pipes.define("b").unwrap();

    let mut runner = Runner::new(&pipes)
        .step(Step::append("a", [json!(1)]))
        .step(Step::call("b", "a", common::double_below_16()).watch())
        .step(Step::call("a", "b", common::double_below_16()).watch());
    let report = runner.run().unwrap();

    assert!(!report.hit_limit);
    assert_eq!(report.passes, 3);
    assert_eq!(
        common::keys(&pipes.pipe("a").unwrap()),
        vec![json!(1), json!(4), json!(16)]
    );
    assert_eq!(common::keys(&pipes.pipe("b").unwrap()), vec![json!(2), json!(8)]);

    // Initial pass: 3 steps. Pass 1: both sides. Pass 2: only b (consumes 16).
    let per_pass: Vec<usize> = (0..3)
        .map(|pass| report.steps.iter().filter(|s| s.pass == pass).count())
        .collect();
    assert_eq!(per_pass, vec![3, 2, 1]);

    // Running again finds nothing to do.
    let mut again = Runner::new(&pipes)
        .step(Step::call("b", "a", common::double_below_16()).watch())
        .step(Step::call("a", "b", common::double_below_16()).watch());
    let report = again.run().unwrap();
    assert_eq!(report.passes, 1);
    assert_eq!(report.written(), 0);
}

#[test]
fn unwatched_steps_run_exactly_once() {
    let pipes = Pipes::open_in_memory().unwrap();
    pipes.define("a").unwrap();
    pipes.define("b").unwrap();

    let mut runner = Runner::new(&pipes)
        .step(Step::append("a", [json!(1)]))
        .step(Step::call("b", "a", common::double_below_16()))
        .step(Step::call("a", "b", common::double_below_16()));
    let report = runner.run().unwrap();

    assert_eq!(report.passes, 0);
    assert_eq!(common::keys(&pipes.pipe("a").unwrap()), vec![json!(1), json!(4)]);
    // b has not seen the 4 yet.
    let b = pipes.pipe("b").unwrap();
    assert_eq!(b.backlog_len(&pipes.pipe("a").unwrap()).unwrap(), 1);
}

#[test]
fn smoke_run_then_full_drain() {
    let pipes = Pipes::open_in_memory().unwrap();
    let src = pipes.define("src").unwrap();
    pipes.define("dst").unwrap();
    src.append((0..10).map(|i| json!(i))).unwrap();

    let mut runner = Runner::new(&pipes).step(Step::call("dst", "src", common::echo()));
    let (smoke, drain) = runner.run_smoke_then_drain(3).unwrap();

    let processed = |outcome: &Outcome| match outcome {
        Outcome::Called(report) => report.processed,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(processed(&smoke.steps[0].outcome), 3);
    assert_eq!(processed(&drain.steps[0].outcome), 7);
    assert_eq!(pipes.pipe("dst").unwrap().count().unwrap(), 10);
}

#[test]
fn maintenance_steps_report_removed_rows() {
    let pipes = Pipes::open_in_memory().unwrap();
    pipes.define("p").unwrap();

    let mut runner = Runner::new(&pipes)
        .step(Step::append("p", [json!(1), json!(1), json!(2)]))
        .step(Step::dedup("p"))
        .step(Step::clean("p", None));
    let report = runner.run().unwrap();

    let outcomes: Vec<&Outcome> = report.steps.iter().map(|s| &s.outcome).collect();
    assert_eq!(
        outcomes,
        vec![&Outcome::Appended(3), &Outcome::Removed(1), &Outcome::Removed(2)]
    );
}

#[test]
fn configured_limit_applies_to_every_call() {
    let config = EngineConfig {
        limit: 2,
        ..EngineConfig::default()
    };
    let pipes = Pipes::open_in_memory_with_config(config).unwrap();
    let src = pipes.define("src").unwrap();
    let dst = pipes.define("dst").unwrap();
    src.append((0..5).map(|i| json!(i))).unwrap();

    // Watching keeps re-running the limited call until the backlog is gone.
    let mut runner = Runner::new(&pipes).step(Step::call("dst", "src", common::echo()).watch());
    let report = runner.run().unwrap();

    assert_eq!(dst.count().unwrap(), 5);
    assert_eq!(report.steps.len(), 3);
}

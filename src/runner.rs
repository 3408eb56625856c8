//! # Runner
//!
//! Drives an ordered list of pipeline steps, then keeps re-running the
//! watched ones until the pipeline reaches a fixed point.
//!
//! ## Execution
//!
//! ```text
//! 1. run every step once, in list order
//! 2. repeat:
//!        for each watched step (source → target):
//!            if target has backlog on source: run it, progress = true
//!    until a pass makes no progress, or max_iterations passes ran
//! ```
//!
//! Watching is what makes feedback edges work. With `a → b` and `b → a` both
//! watched, output appended to `b` shows up as backlog for `a`, and the loop
//! keeps going until neither side produces anything new. The loop is an
//! explicit iteration with a pass limit, never recursion, so a pipeline that
//! does not converge stops with `RunReport::hit_limit` set instead of
//! running forever.
//!
//! ## Example
//!
//! ```rust
//! use pipedb::handler::from_fn;
//! use pipedb::runner::{Runner, Step};
//! use pipedb::types::{Item, Record};
//! use pipedb::Pipes;
//! use serde_json::json;
//!
//! let pipes = Pipes::open_in_memory()?;
//! pipes.define("urls")?;
//! pipes.define("pages")?;
//!
//! let mut runner = Runner::new(&pipes)
//!     .step(Step::append("urls", [json!("https://example.com")]))
//!     .step(Step::call("pages", "urls", from_fn(|r: &Record| {
//!         Ok(vec![Item::new(r.key.clone(), json!({"status": 200}))])
//!     })));
//!
//! let report = runner.run()?;
//! assert_eq!(report.steps.len(), 2);
//! assert_eq!(pipes.pipe("pages")?.count()?, 1);
//! # Ok::<(), pipedb::Error>(())
//! ```

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::handler::{Download, Handler};
use crate::pipe::{CallOptions, CallReport, Interrupt, Pipes};
use crate::types::Item;

// =============================================================================
// Steps
// =============================================================================

/// What a step does to its target pipe.
enum Operation {
    Append(Vec<Item>),
    Call {
        source: String,
        handler: Box<dyn Handler>,
    },
    Download {
        source: String,
        downloader: Box<dyn Download>,
    },
    Retry {
        source: String,
        handler: Box<dyn Handler>,
    },
    Dedup,
    Compact,
    Clean(Option<Duration>),
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::Append(_) => "append",
            Operation::Call { .. } => "call",
            Operation::Download { .. } => "download",
            Operation::Retry { .. } => "retry",
            Operation::Dedup => "dedup",
            Operation::Compact => "compact",
            Operation::Clean(_) => "clean",
        }
    }

    fn source(&self) -> Option<&str> {
        match self {
            Operation::Call { source, .. }
            | Operation::Download { source, .. }
            | Operation::Retry { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// One entry of a pipeline: an operation on a target pipe.
///
/// Pipes are named, not borrowed, so a schedule can be built before the
/// pipes it uses are looked up.
pub struct Step {
    target: String,
    op: Operation,
    watch: bool,
}

impl Step {
    fn new(target: impl Into<String>, op: Operation) -> Self {
        Self {
            target: target.into(),
            op,
            watch: false,
        }
    }

    /// Appends fixed items to `target`. Runs on every `run`, so seeds are
    /// appended again by a second run.
    pub fn append<I>(target: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Item>,
    {
        let items = items.into_iter().map(Into::into).collect();
        Self::new(target, Operation::Append(items))
    }

    /// Runs `handler` over `source`'s backlog into `target`.
    pub fn call(target: impl Into<String>, source: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(
            target,
            Operation::Call {
                source: source.into(),
                handler: Box::new(handler),
            },
        )
    }

    /// Runs `downloader` over `source`'s backlog into `target`.
    pub fn download(
        target: impl Into<String>,
        source: impl Into<String>,
        downloader: impl Download + 'static,
    ) -> Self {
        Self::new(
            target,
            Operation::Download {
                source: source.into(),
                downloader: Box::new(downloader),
            },
        )
    }

    /// Retries the error queue of the edge `source → target`.
    pub fn retry(target: impl Into<String>, source: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(
            target,
            Operation::Retry {
                source: source.into(),
                handler: Box::new(handler),
            },
        )
    }

    /// Keeps the first record per key in `target`.
    pub fn dedup(target: impl Into<String>) -> Self {
        Self::new(target, Operation::Dedup)
    }

    /// Keeps the last record per key in `target`.
    pub fn compact(target: impl Into<String>) -> Self {
        Self::new(target, Operation::Compact)
    }

    /// Deletes records older than `max_age` (all if `None`) from `target`.
    pub fn clean(target: impl Into<String>, max_age: Option<Duration>) -> Self {
        Self::new(target, Operation::Clean(max_age))
    }

    /// Re-runs this step whenever its source has backlog.
    ///
    /// Only `call` and `download` steps can be watched; [`Runner::run`]
    /// rejects anything else.
    pub fn watch(mut self) -> Self {
        self.watch = true;
        self
    }

    /// Target pipe name.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Source pipe name, for steps that consume one.
    pub fn source(&self) -> Option<&str> {
        self.op.source()
    }

    /// Whether the step is watched.
    pub fn is_watched(&self) -> bool {
        self.watch
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("op", &self.op.name())
            .field("source", &self.op.source())
            .field("target", &self.target)
            .field("watch", &self.watch)
            .finish()
    }
}

// =============================================================================
// Reports
// =============================================================================

/// What a single step execution did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Items appended by an append step
    Appended(usize),
    /// Result of a call, download or retry
    Called(CallReport),
    /// Records deleted by dedup, compact or clean
    Removed(usize),
}

/// One step execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Index of the step in the schedule
    pub index: usize,
    /// Fixed-point pass it ran in (0 for the initial pass)
    pub pass: usize,
    /// Operation name (`call`, `dedup`, ...)
    pub operation: &'static str,
    /// Target pipe
    pub target: String,
    /// Source pipe, if the step has one
    pub source: Option<String>,
    /// What happened
    pub outcome: Outcome,
}

/// Everything one [`Runner::run`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Every step execution, in order
    pub steps: Vec<StepReport>,
    /// Fixed-point passes over the watched steps, including the final one
    /// that found nothing to do
    pub passes: usize,
    /// Whether the pass limit stopped the loop while steps still made progress
    pub hit_limit: bool,
}

impl RunReport {
    /// Records quarantined or still failing across every step.
    pub fn failed(&self) -> usize {
        self.steps
            .iter()
            .map(|s| match s.outcome {
                Outcome::Called(report) => report.failed,
                _ => 0,
            })
            .sum()
    }

    /// Items written across every step.
    pub fn written(&self) -> usize {
        self.steps
            .iter()
            .map(|s| match s.outcome {
                Outcome::Appended(n) => n,
                Outcome::Called(report) => report.written,
                Outcome::Removed(_) => 0,
            })
            .sum()
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Executes a schedule of [`Step`]s against a [`Pipes`] registry.
pub struct Runner<'p> {
    pipes: &'p Pipes,
    steps: Vec<Step>,
    options: CallOptions,
    max_iterations: usize,
}

impl<'p> Runner<'p> {
    /// Creates an empty schedule using the registry's configured `limit`,
    /// `error_limit` and `max_iterations`.
    pub fn new(pipes: &'p Pipes) -> Self {
        Self {
            pipes,
            steps: Vec::new(),
            options: CallOptions::from(pipes.config()),
            max_iterations: pipes.config().max_iterations,
        }
    }

    /// Adds a step at the end of the schedule.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a step at the end of the schedule.
    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Replaces the options passed to every call, download and retry.
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Attaches a stop flag to every step.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.options.interrupt = Some(interrupt);
        self
    }

    /// Caps the number of fixed-point passes.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// The steps in schedule order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Runs every step once, then the watched steps to a fixed point.
    ///
    /// # Errors
    ///
    /// The first step error stops the run: unknown pipe names, a watched
    /// step that has no source, an exceeded error limit, an interrupt, or a
    /// storage failure.
    pub fn run(&mut self) -> Result<RunReport> {
        let watched = self.watched()?;
        let mut report = RunReport::default();

        for index in 0..self.steps.len() {
            let step_report = self.execute(index, 0)?;
            report.steps.push(step_report);
        }

        if watched.is_empty() {
            return Ok(report);
        }

        let mut progressed = true;
        while progressed && report.passes < self.max_iterations {
            report.passes += 1;
            progressed = false;

            for &index in &watched {
                if self.has_backlog(index)? {
                    let step_report = self.execute(index, report.passes)?;
                    report.steps.push(step_report);
                    progressed = true;
                }
            }
            tracing::info!(pass = report.passes, progressed, "fixed-point pass finished");
        }

        if progressed {
            report.hit_limit = true;
            tracing::warn!(
                passes = report.passes,
                "iteration limit reached before the pipeline settled"
            );
        }
        Ok(report)
    }

    /// Runs the whole schedule with `smoke_limit` records per call, then
    /// again with no limit.
    ///
    /// The small first run pushes a few records through every edge so a
    /// broken step fails fast, before the expensive full drain.
    pub fn run_smoke_then_drain(&mut self, smoke_limit: usize) -> Result<(RunReport, RunReport)> {
        let configured = self.options.limit;

        self.options.limit = smoke_limit;
        let smoke = self.run();
        self.options.limit = 0;
        let drain = smoke.and_then(|smoke| Ok((smoke, self.run()?)));

        self.options.limit = configured;
        drain
    }

    /// Indexes of watched steps, rejecting those that cannot be watched.
    fn watched(&self) -> Result<Vec<usize>> {
        let mut watched = Vec::new();
        for (index, step) in self.steps.iter().enumerate() {
            if !step.watch {
                continue;
            }
            match step.op {
                Operation::Call { .. } | Operation::Download { .. } => watched.push(index),
                _ => {
                    return Err(Error::Config(format!(
                        "step {index} ({} into '{}') cannot be watched: only call and download steps consume a backlog",
                        step.op.name(),
                        step.target
                    )));
                }
            }
        }
        Ok(watched)
    }

    fn has_backlog(&self, index: usize) -> Result<bool> {
        let step = &self.steps[index];
        let Some(source) = step.op.source() else {
            return Ok(false);
        };
        let source = self.pipes.pipe(source)?;
        self.pipes.pipe(&step.target)?.has_backlog(&source)
    }

    fn execute(&mut self, index: usize, pass: usize) -> Result<StepReport> {
        let pipes = self.pipes;
        let options = &self.options;
        let step = &mut self.steps[index];
        let target = pipes.pipe(&step.target)?;
        let source = match step.op.source() {
            Some(name) => Some(pipes.pipe(name)?),
            None => None,
        };

        let outcome = match (&mut step.op, &source) {
            (Operation::Append(items), _) => {
                let appended = items.len();
                target.append(items.iter().cloned())?;
                Outcome::Appended(appended)
            }
            (Operation::Call { handler, .. }, Some(source)) => {
                Outcome::Called(target.call(source, handler, options)?)
            }
            (Operation::Download { downloader, .. }, Some(source)) => {
                Outcome::Called(target.download(source, downloader, options)?)
            }
            (Operation::Retry { handler, .. }, Some(source)) => {
                Outcome::Called(target.retry(source, handler, options)?)
            }
            (Operation::Dedup, _) => Outcome::Removed(target.dedup()?),
            (Operation::Compact, _) => Outcome::Removed(target.compact()?),
            (Operation::Clean(max_age), _) => Outcome::Removed(target.clean(*max_age)?),
            (op, None) => {
                return Err(Error::Config(format!(
                    "step {index} ({} into '{}') has no source",
                    op.name(),
                    step.target
                )));
            }
        };

        tracing::debug!(index, pass, operation = step.op.name(), target = %step.target, "step finished");
        Ok(StepReport {
            index,
            pass,
            operation: step.op.name(),
            target: step.target.clone(),
            source: source.map(|s| s.name().to_string()),
            outcome,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

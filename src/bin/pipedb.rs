//! pipedb Operator CLI
//!
//! Inspects and repairs a pipe database without running a pipeline: edge
//! status, the error queue, cursor moves, and maintenance.
//! Run with: `cargo run --bin pipedb -- [OPTIONS] <COMMAND>`
//!
//! # Examples
//!
//! ```bash
//! # Every pipe and every edge with backlog and error counts
//! cargo run --bin pipedb -- --db crawl.db status
//!
//! # What failed on pages → items, then drop the entries for one key
//! cargo run --bin pipedb -- --db crawl.db errors pages items
//! cargo run --bin pipedb -- --db crawl.db resolve pages items '"https://example.com"'
//!
//! # Reprocess the last 100 pages
//! cargo run --bin pipedb -- --db crawl.db seek pages items -100
//! ```
//!
//! Logging goes to stderr through `tracing`; set `RUST_LOG=debug` for per-flush
//! detail.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use pipedb::{EdgeStatus, EngineConfig, Error, Pipes, Result};
use tracing_subscriber::EnvFilter;

const USAGE: &str = r#"pipedb operator CLI

Usage: pipedb [OPTIONS] <COMMAND>

Commands:
  status [pipe]                       Pipes and edges with backlog and error counts
  errors <source> <target>            List the error queue of an edge
  resolve <source> <target> [KEY]     Drop error entries (KEY is JSON, e.g. '"a"' or 42)
  reset <source> <target>             Replay the whole source
  skip <source> <target>              Mark the current backlog as consumed
  seek <source> <target> <N>          Move the cursor N records (negative = back)
  dedup <pipe>                        Keep the first record per key
  compact <pipe>                      Keep the last record per key
  clean <pipe> [MAX_AGE_SECS]         Delete old records (all if no age given)
  compress <pipe>                     zstd-compress stored values
  decompress <pipe>                   Store values uncompressed

Options:
  -d, --db <PATH>       Database path (default: pipedb.db)
  -c, --config <PATH>   YAML engine config
  -h, --help            Show this help
"#;

/// Parsed command line.
struct Args {
    /// Path to database file
    db_path: PathBuf,
    /// Optional YAML config file
    config_path: Option<PathBuf>,
    /// Command and its operands
    command: Vec<String>,
}

fn usage_error(message: impl Into<String>) -> Error {
    Error::Config(format!("{}\n\n{USAGE}", message.into()))
}

fn parse_args() -> Result<Option<Args>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut parsed = Args {
        db_path: PathBuf::from("pipedb.db"),
        config_path: None,
        command: Vec::new(),
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                i += 1;
                let path = args.get(i).ok_or_else(|| usage_error("--db needs a path"))?;
                parsed.db_path = PathBuf::from(path);
            }
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).ok_or_else(|| usage_error("--config needs a path"))?;
                parsed.config_path = Some(PathBuf::from(path));
            }
            "--help" | "-h" => return Ok(None),
            // Everything from the command on is positional, so "-5" in
            // `seek a b -5` is an operand, not an option.
            _ => {
                parsed.command = args[i..].to_vec();
                break;
            }
        }
        i += 1;
    }

    if parsed.command.is_empty() {
        return Err(usage_error("missing command"));
    }
    Ok(Some(parsed))
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let config = match &args.config_path {
        Some(path) => EngineConfig::from_yaml_file(path)?,
        None => EngineConfig::default(),
    };
    config.with_env_overrides()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let pipes = Pipes::open_with_config(&args.db_path, config)?;
    let operands: Vec<&str> = args.command[1..].iter().map(String::as_str).collect();

    match (args.command[0].as_str(), operands.as_slice()) {
        ("status", []) => status(&pipes),
        ("status", [pipe]) => {
            print_edges(&pipes.pipe(pipe)?.inputs()?);
            Ok(())
        }
        ("errors", [source, target]) => errors(&pipes, source, target),
        ("resolve", [source, target, rest @ ..]) if rest.len() <= 1 => {
            let key = rest
                .first()
                .map(|raw| serde_json::from_str::<serde_json::Value>(raw))
                .transpose()?;
            let source = pipes.pipe(source)?;
            let resolved = pipes.pipe(target)?.resolve(&source, key.as_ref())?;
            println!("resolved {resolved} error entries");
            Ok(())
        }
        ("reset", [source, target]) => {
            let source = pipes.pipe(source)?;
            let offset = pipes.pipe(target)?.reset(&source)?;
            println!("offset now {offset}");
            Ok(())
        }
        ("skip", [source, target]) => {
            let source = pipes.pipe(source)?;
            let offset = pipes.pipe(target)?.skip(&source)?;
            println!("offset now {offset}");
            Ok(())
        }
        ("seek", [source, target, n]) => {
            let n: i64 = n
                .parse()
                .map_err(|_| usage_error(format!("seek distance is not an integer: '{n}'")))?;
            let source = pipes.pipe(source)?;
            let offset = pipes.pipe(target)?.seek(&source, n)?;
            println!("offset now {offset}");
            Ok(())
        }
        ("dedup", [pipe]) => {
            println!("deleted {} records", pipes.pipe(pipe)?.dedup()?);
            Ok(())
        }
        ("compact", [pipe]) => {
            println!("deleted {} records", pipes.pipe(pipe)?.compact()?);
            Ok(())
        }
        ("clean", [pipe, rest @ ..]) if rest.len() <= 1 => {
            let max_age = rest
                .first()
                .map(|raw| {
                    raw.parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| usage_error(format!("max age is not a number of seconds: '{raw}'")))
                })
                .transpose()?;
            println!("deleted {} records", pipes.pipe(pipe)?.clean(max_age)?);
            Ok(())
        }
        ("compress", [pipe]) => {
            println!("compressed {} records", pipes.pipe(pipe)?.compress()?);
            Ok(())
        }
        ("decompress", [pipe]) => {
            println!("decompressed {} records", pipes.pipe(pipe)?.decompress()?);
            Ok(())
        }
        (command, _) => Err(usage_error(format!("bad usage of '{command}'"))),
    }
}

fn status(pipes: &Pipes) -> Result<()> {
    println!("Pipes");
    println!("-----");
    for def in pipes.list()? {
        let pipe = pipes.pipe(&def.name)?;
        let location = def
            .location
            .as_ref()
            .map(|p| format!(" ({})", p.display()))
            .unwrap_or_default();
        println!(
            "  {:<24} {:>10} records  max id {:>10}{location}",
            def.name,
            pipe.count()?,
            pipe.max_id()?
        );
    }

    println!();
    print_edges(&pipes.status()?);
    Ok(())
}

fn print_edges(edges: &[EdgeStatus]) {
    println!("Edges");
    println!("-----");
    for edge in edges {
        println!(
            "  {:<24} offset {:>10}  backlog {:>8}  errors {:>6}",
            format!("{} -> {}", edge.source, edge.target),
            edge.offset,
            edge.backlog,
            edge.errors
        );
    }
}

fn errors(pipes: &Pipes, source: &str, target: &str) -> Result<()> {
    let source = pipes.pipe(source)?;
    let target = pipes.pipe(target)?;

    let mut shown = 0;
    for entry in target.errors(&source)? {
        let entry = entry?;
        println!(
            "  #{:<8} key {}  retries {}  {}",
            entry.record.id, entry.record.key, entry.retries, entry.message
        );
        shown += 1;
    }
    println!("{shown} error entries on {} -> {}", source.name(), target.name());
    Ok(())
}

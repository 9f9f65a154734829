//! Instruction Annotation CLI Application
//!
//! Command-line front end for the insn-annotation library:
//! - Loads and validates annotation configuration
//! - Binds declarative callbacks to annotation names
//! - Replays a recorded trace through the dispatcher and reports the outcome

use anyhow::{Context, Result};
use clap::Parser;
use insn_annotation::{
    sim, InMemoryKeyValueStore, InstructionAnnotation, KeyValueStore, Simulator, Trace,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod callbacks;
mod config;
mod report;

/// Instruction annotations - run callbacks on configured instructions of a trace
#[derive(Parser, Debug)]
#[command(name = "insn-annotation-cli")]
#[command(about = "Validate instruction annotations and replay traces through them", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the annotation configuration (annotations.toml)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Path to a JSON trace to replay
    #[arg(short, long, value_name = "FILE")]
    trace: Option<PathBuf>,

    /// Maximum number of states, forks included
    #[arg(long, value_name = "COUNT")]
    max_states: Option<u64>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::info!("Instruction Annotation CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using annotation library v{}", insn_annotation::VERSION);

    log::info!("Loading configuration from: {:?}", args.config);
    let config = config::load_config(&args.config)?;
    let registry = config.build_registry()?;
    log::debug!("Configuration loaded successfully");

    match &args.trace {
        None => {
            if !args.quiet {
                print!("{}", report::registry_summary(&registry));
            }
            Ok(())
        }
        Some(trace_path) => replay_mode(&args, config, registry, trace_path),
    }
}

/// Replay mode - bind callbacks, replay the trace, print the report
fn replay_mode(
    args: &Args,
    config: config::AppConfig,
    registry: insn_annotation::AnnotationRegistry,
    trace_path: &Path,
) -> Result<()> {
    let trace = Trace::load(trace_path)
        .with_context(|| format!("Failed to load trace: {:?}", trace_path))?;

    let (callbacks, counts) = callbacks::build_callbacks(&config.callbacks.simple);

    let kvs = if config.kvs.enabled {
        Some(Arc::new(InMemoryKeyValueStore::new()) as Arc<dyn KeyValueStore>)
    } else {
        log::warn!("Key-value store disabled, forks are only limited per lineage");
        None
    };

    let mut plugin = InstructionAnnotation::new(registry, sim::collaborators(&trace, kvs), &callbacks)
        .context("Failed to initialize instruction annotations")?;

    let mut simulator = Simulator::new(&trace, &mut plugin).context("Failed to translate trace")?;
    if let Some(max_states) = args.max_states {
        simulator = simulator.with_max_states(max_states);
    }

    let report = simulator.run(&plugin).context("Replay failed")?;

    if !args.quiet {
        print!("{}", report::replay_summary(&report, &counts));
    }

    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

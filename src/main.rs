//! chartrun - SCXML statechart interpreter
//!
//! Runs a statechart document against a JSONL event stream and writes one
//! JSON trace record per processed event.

mod config;

use chartrun_core::{load_document, CoreError, TraceOptions, TraceRunner};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use config::Config;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chartrun")]
#[command(about = "Deterministic SCXML statechart interpreter emitting JSONL traces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chart against an event stream and emit a trace
    Trace(TraceArgs),
}

#[derive(Args)]
struct TraceArgs {
    /// Statechart document (scjson, or SCXML with --xml)
    #[arg(short = 'I', long)]
    input: PathBuf,

    /// JSONL event stream (stdin when omitted)
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Trace output file (stdout when omitted)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Treat the input as SCXML
    #[arg(long)]
    xml: bool,

    /// Report only leaf states
    #[arg(long)]
    leaf_only: bool,

    /// Omit actionLog entries
    #[arg(long)]
    omit_actions: bool,

    /// Omit datamodelDelta entries
    #[arg(long)]
    omit_delta: bool,

    /// Omit firedTransitions entries
    #[arg(long)]
    omit_transitions: bool,

    /// Seconds to advance the clock before the first event
    #[arg(long)]
    advance_time: Option<f64>,

    /// Maximum number of event steps to process
    #[arg(long)]
    max_steps: Option<u64>,

    /// Blank step 0 datamodelDelta and firedTransitions
    #[arg(long)]
    strip_step0_noise: bool,

    /// Blank step 0 enteredStates and exitedStates
    #[arg(long)]
    strip_step0_states: bool,

    /// Keep transition conditions in firedTransitions
    #[arg(long)]
    keep_cond: bool,

    /// YAML configuration file
    #[arg(short, long, env = "CHARTRUN_CONFIG")]
    config: Option<PathBuf>,
}

impl TraceArgs {
    /// Flags only switch options on; values replace configured ones.
    fn apply(&self, trace: &mut TraceOptions) {
        trace.leaf_only |= self.leaf_only;
        trace.omit_actions |= self.omit_actions;
        trace.omit_delta |= self.omit_delta;
        trace.omit_transitions |= self.omit_transitions;
        trace.strip_step0_noise |= self.strip_step0_noise;
        trace.strip_step0_states |= self.strip_step0_states;
        trace.keep_cond |= self.keep_cond;
        if let Some(secs) = self.advance_time {
            trace.advance_time = secs;
        }
        if let Some(max) = self.max_steps {
            trace.max_steps = Some(max);
        }
    }
}

fn main() {
    // Logs go to stderr so stdout stays pure JSONL
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Trace(args) => run_trace(&args),
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
}

fn run_trace(args: &TraceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config.trace);
    config.validate()?;

    let doc = load_document(&args.input, args.xml, None)?;
    if !doc.duplicate_ids().is_empty() {
        tracing::warn!("duplicate state ids: {}", doc.duplicate_ids().join(", "));
    }

    let events: Box<dyn BufRead> = match &args.events {
        Some(path) => Box::new(BufReader::new(open(path)?)),
        None => Box::new(io::stdin().lock()),
    };
    let sink: Box<dyn Write> = match &args.out {
        Some(path) => Box::new(BufWriter::new(create(path)?)),
        None => Box::new(io::stdout().lock()),
    };

    let mut runner = TraceRunner::with_limits(doc, config.limits, config.trace);
    let written = runner.run(events, sink)?;

    let interpreter = runner.interpreter();
    tracing::debug!(
        "wrote {} record(s), final configuration {:?}",
        written,
        interpreter.configuration()
    );
    if !interpreter.diagnostics().is_empty() {
        eprintln!(
            "{}: {} engine limit(s) reached",
            "Warning".yellow(),
            interpreter.diagnostics().len()
        );
    }

    Ok(())
}

fn open(path: &Path) -> Result<File, CoreError> {
    File::open(path).map_err(|source| CoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn create(path: &Path) -> Result<File, CoreError> {
    File::create(path).map_err(|source| CoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_trace_flags() {
        let cli = Cli::try_parse_from([
            "chartrun",
            "trace",
            "-I",
            "chart.json",
            "-e",
            "events.jsonl",
            "--leaf-only",
            "--max-steps",
            "5",
            "--advance-time",
            "0.5",
        ])
        .unwrap();

        let Commands::Trace(args) = cli.command;
        assert_eq!(args.input, PathBuf::from("chart.json"));
        assert_eq!(args.events, Some(PathBuf::from("events.jsonl")));
        assert!(args.out.is_none());

        let mut trace = TraceOptions {
            keep_cond: true,
            ..Default::default()
        };
        args.apply(&mut trace);
        assert!(trace.leaf_only);
        assert!(trace.keep_cond);
        assert_eq!(trace.max_steps, Some(5));
        assert_eq!(trace.advance_time, 0.5);
    }

    #[test]
    fn test_cli_requires_input() {
        assert!(Cli::try_parse_from(["chartrun", "trace"]).is_err());
    }
}

//! girder - build orchestrator CLI.

mod cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// girder - demand-driven build orchestrator
#[derive(Parser)]
#[command(name = "girder")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Workspace root directory
  #[arg(long, global = true, default_value = ".")]
  root: PathBuf,

  /// Entry module label
  #[arg(long, global = true, default_value = "//:BUILD.lua")]
  entry: String,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Load, analyze, and build the requested outputs
  Build {
    /// Workspace-relative output paths (default: everything)
    outputs: Vec<String>,

    /// Maximum concurrent steps
    #[arg(short, long, default_value_t = 8)]
    jobs: usize,

    /// Per-step time limit in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Stop scheduling after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Do not persist step fingerprints across invocations
    #[arg(long)]
    no_cache: bool,
  },

  /// Inspect the target graph without executing anything
  Query {
    #[command(subcommand)]
    what: cmd::QueryWhat,
  },

  /// Build and print a phase timing report
  Trace {
    /// Workspace-relative output paths (default: everything)
    outputs: Vec<String>,

    /// Emit JSON lines instead of a text report
    #[arg(long)]
    json: bool,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .without_time()
    .init();

  let cli = Cli::parse();

  match cli.command {
    Commands::Build {
      outputs,
      jobs,
      timeout,
      fail_fast,
      no_cache,
    } => cmd::cmd_build(&cli.root, &cli.entry, &outputs, jobs, timeout, fail_fast, no_cache),
    Commands::Query { what } => cmd::cmd_query(&cli.root, &cli.entry, &what),
    Commands::Trace { outputs, json } => cmd::cmd_trace(&cli.root, &cli.entry, &outputs, json),
  }
}

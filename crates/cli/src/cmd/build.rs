//! Implementation of the `girder build` command.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use girder_lib::invocation::{BuildError, Invocation, InvocationOptions};
use girder_lib::label::Label;
use girder_lib::sched::ExecOptions;

/// Execute the build command.
///
/// Loads the entry module, analyzes the declared targets, and executes the
/// minimal closure of steps producing the requested outputs. Prints a
/// summary of what ran, what was cached, and what failed.
pub fn cmd_build(
  root: &Path,
  entry: &str,
  outputs: &[String],
  jobs: usize,
  timeout: Option<u64>,
  fail_fast: bool,
  no_cache: bool,
) -> Result<()> {
  let entry: Label = entry.parse().with_context(|| format!("invalid entry label '{}'", entry))?;

  let mut options = InvocationOptions::new(root, entry);
  options.requested = outputs.iter().map(PathBuf::from).collect();
  options.exec = ExecOptions {
    parallelism: jobs,
    timeout: timeout.map(Duration::from_secs),
    fail_fast,
  };
  options.persist_state = !no_cache;

  let invocation = Invocation::new(options);

  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  let report = match rt.block_on(invocation.run()) {
    Ok(report) => report,
    Err(BuildError::Analysis { failed, skipped }) => {
      for (target, err) in &failed {
        eprintln!("error: {}: {}", target, err);
      }
      for (target, dep) in &skipped {
        eprintln!("skipped: {} (dependency {} failed)", target, dep);
      }
      bail!("analysis failed for {} target(s)", failed.len());
    }
    Err(err) => return Err(err).context("build failed"),
  };

  println!();
  println!("Build complete!");
  println!("  Targets:  {}", report.targets);
  println!("  Steps:    {}", report.steps);
  println!("  Executed: {}", report.outcome.executed.len());
  println!("  Cached:   {}", report.outcome.cached.len());
  for path in &report.outcome.produced {
    println!("  Produced: {}", path.display());
  }

  if !report.outcome.is_success() {
    for (step, err) in &report.outcome.failed {
      eprintln!("  Step failed: {} - {}", step, err);
    }
    for (step, cause) in &report.outcome.skipped {
      eprintln!("  Step skipped: {} (blocked by {})", step, cause);
    }
    bail!("{} step(s) failed", report.outcome.failed.len());
  }

  Ok(())
}

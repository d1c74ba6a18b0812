//! Implementation of the `girder trace` command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use girder_lib::invocation::{Invocation, InvocationOptions};
use girder_lib::label::Label;

/// Run a build and print where the time went, per phase.
pub fn cmd_trace(root: &Path, entry: &str, outputs: &[String], json: bool) -> Result<()> {
  let entry: Label = entry.parse().with_context(|| format!("invalid entry label '{}'", entry))?;

  let mut options = InvocationOptions::new(root, entry);
  options.requested = outputs.iter().map(PathBuf::from).collect();

  let invocation = Invocation::new(options);

  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  rt.block_on(invocation.run()).context("build failed")?;

  if json {
    invocation.recorder().write_json_lines(std::io::stdout().lock())?;
  } else {
    println!("{:>8}    {:>8}    {:<10} {}", "start", "duration", "phase", "name");
    print!("{}", invocation.recorder().render_text());
  }

  Ok(())
}

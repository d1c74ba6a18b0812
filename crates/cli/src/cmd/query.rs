//! Implementation of the `girder query` command.
//!
//! Loads and analyzes the workspace, then answers read-only questions
//! about the target and step graphs. Nothing executes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;

use girder_lib::analysis::Analyzer;
use girder_lib::graph::TargetGraph;
use girder_lib::label::Label;
use girder_lib::loader::ModuleLoader;
use girder_lib::query::QueryEngine;
use girder_lib::rule::RuleRegistry;

#[derive(Subcommand)]
pub enum QueryWhat {
  /// Direct (or transitive) dependencies of a target
  Deps {
    target: String,

    #[arg(long)]
    transitive: bool,
  },

  /// Direct dependents of a target
  Rdeps { target: String },

  /// All targets in dependency order
  Topo,

  /// Output files a target's steps produce
  Outputs { target: String },

  /// The target producing a given output path
  Producer { path: PathBuf },
}

pub fn cmd_query(root: &Path, entry: &str, what: &QueryWhat) -> Result<()> {
  let entry: Label = entry.parse().with_context(|| format!("invalid entry label '{}'", entry))?;

  let loader = ModuleLoader::new(root)?;
  loader.load(&entry).context("loading failed")?;
  let graph = TargetGraph::from_targets(loader.targets())?;

  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  let analyzer = Analyzer::new(root, 8);
  let analysis = rt.block_on(analyzer.analyze(&graph, &RuleRegistry::with_builtins()));
  if !analysis.is_success() {
    for (target, err) in &analysis.failed {
      eprintln!("error: {}: {}", target, err);
    }
    bail!("analysis failed for {} target(s)", analysis.failed.len());
  }

  let query = QueryEngine::new(&graph, &analysis.steps);

  match what {
    QueryWhat::Deps { target, transitive } => {
      let target: Label = target.parse()?;
      for dep in query.deps(&target, *transitive)? {
        println!("{}", dep);
      }
    }
    QueryWhat::Rdeps { target } => {
      let target: Label = target.parse()?;
      for dep in query.rdeps(&target)? {
        println!("{}", dep);
      }
    }
    QueryWhat::Topo => {
      for label in query.topo_order() {
        println!("{}", label);
      }
    }
    QueryWhat::Outputs { target } => {
      let target: Label = target.parse()?;
      for path in query.outputs(&target)? {
        println!("{}", path.display());
      }
    }
    QueryWhat::Producer { path } => match query.producer(path) {
      Some(target) => println!("{}", target),
      None => bail!("no step produces {}", path.display()),
    },
  }

  Ok(())
}

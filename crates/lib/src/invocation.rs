//! One build invocation, end to end.
//!
//! An invocation owns every piece of otherwise-global state for a single
//! build: the module cache (inside the loader), the analysis cache (inside
//! the analyzer), the step cache, and the trace recorder. Everything is
//! created at invocation start and dropped with it; only the step cache
//! optionally persists, keyed by content fingerprints.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::analysis::{AnalysisError, Analyzer};
use crate::cache::StepCache;
use crate::consts::STATE_DIR;
use crate::graph::{GraphError, TargetGraph};
use crate::label::Label;
use crate::loader::{LoadError, ModuleLoader};
use crate::profile::Recorder;
use crate::rule::RuleRegistry;
use crate::sched::{BuildOutcome, ExecError, ExecOptions, LocalExecutor, Scheduler, StepExecutor};
use crate::step::StepGraph;

/// Everything that failed the invocation before or during execution.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
  #[error(transparent)]
  Load(#[from] LoadError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("analysis failed for {} target(s)", failed.len())]
  Analysis {
    failed: BTreeMap<Label, AnalysisError>,
    skipped: BTreeMap<Label, Label>,
  },

  #[error(transparent)]
  Exec(#[from] ExecError),
}

/// Invocation configuration.
#[derive(Debug, Clone)]
pub struct InvocationOptions {
  /// Workspace root directory.
  pub root: PathBuf,

  /// Entry module, e.g. `//app:BUILD.lua`.
  pub entry: Label,

  /// Workspace-relative outputs to produce. Empty means every declared
  /// step output.
  pub requested: Vec<PathBuf>,

  /// Execution tuning.
  pub exec: ExecOptions,

  /// Persist step fingerprints under the workspace state directory so the
  /// next invocation can reuse them.
  pub persist_state: bool,
}

impl InvocationOptions {
  pub fn new(root: impl Into<PathBuf>, entry: Label) -> Self {
    Self {
      root: root.into(),
      entry,
      requested: Vec::new(),
      exec: ExecOptions::default(),
      persist_state: false,
    }
  }
}

/// What one invocation produced.
#[derive(Debug)]
pub struct BuildReport {
  /// Number of declared targets.
  pub targets: usize,

  /// Number of registered steps.
  pub steps: usize,

  /// Execution results for the demanded closure.
  pub outcome: BuildOutcome,
}

/// A single build invocation: load, analyze, schedule.
pub struct Invocation {
  options: InvocationOptions,
  registry: RuleRegistry,
  recorder: Arc<Recorder>,
  step_cache: Arc<StepCache>,
  executor: Arc<dyn StepExecutor>,
}

impl Invocation {
  pub fn new(options: InvocationOptions) -> Self {
    let step_cache = if options.persist_state {
      Arc::new(StepCache::persistent(options.root.join(STATE_DIR)))
    } else {
      Arc::new(StepCache::in_memory())
    };
    Self {
      options,
      registry: RuleRegistry::with_builtins(),
      recorder: Arc::new(Recorder::new()),
      step_cache,
      executor: Arc::new(LocalExecutor),
    }
  }

  /// Replace the rule registry, e.g. to add project-specific rules.
  pub fn with_registry(mut self, registry: RuleRegistry) -> Self {
    self.registry = registry;
    self
  }

  /// Replace the step executor; tests use this to observe scheduling.
  pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
    self.executor = executor;
    self
  }

  pub fn recorder(&self) -> &Recorder {
    &self.recorder
  }

  /// Run the invocation end to end.
  ///
  /// 1. Load the entry module, transitively evaluating its imports.
  /// 2. Build the target graph from the collected declarations.
  /// 3. Analyze every target into providers and steps.
  /// 4. Schedule and execute the demanded closure of steps.
  pub async fn run(&self) -> Result<BuildReport, BuildError> {
    let started = Instant::now();
    let targets = {
      let loader = ModuleLoader::new(&self.options.root)?;
      loader.load(&self.options.entry)?;
      loader.targets()
    };
    self.recorder.record("load", self.options.entry.to_string(), started);
    info!(entry = %self.options.entry, targets = targets.len(), "loading complete");

    let graph = TargetGraph::from_targets(targets)?;

    let started = Instant::now();
    let analyzer = Analyzer::new(&self.options.root, self.options.exec.parallelism);
    let analysis = analyzer.analyze(&graph, &self.registry).await;
    self.recorder.record("analysis", self.options.entry.to_string(), started);
    if !analysis.is_success() {
      return Err(BuildError::Analysis {
        failed: analysis.failed,
        skipped: analysis.skipped,
      });
    }

    let requested = if self.options.requested.is_empty() {
      all_outputs(&analysis.steps)
    } else {
      self.options.requested.clone()
    };

    let started = Instant::now();
    let scheduler = Scheduler::new(
      &self.options.root,
      self.options.exec.clone(),
      self.step_cache.clone(),
      self.executor.clone(),
    );
    let outcome = scheduler.build(&analysis.steps, &requested).await?;
    self.recorder.record("execute", format!("{} steps", analysis.steps.len()), started);

    Ok(BuildReport {
      targets: graph.len(),
      steps: analysis.steps.len(),
      outcome,
    })
  }
}

fn all_outputs(steps: &StepGraph) -> Vec<PathBuf> {
  let mut outputs: Vec<PathBuf> = steps
    .ids()
    .filter_map(|id| steps.get(id))
    .flat_map(|def| def.outputs.iter().cloned())
    .collect();
  outputs.sort();
  outputs.dedup();
  outputs
}

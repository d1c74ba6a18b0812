//! Steps and the step graph.
//!
//! A step is a unit of deferred work with explicit declared inputs and
//! outputs and opaque execution-time behavior. Steps are content-addressed:
//! a step's identity is the hash of its definition, so re-registering an
//! identical step is idempotent. The step graph is keyed by output path;
//! two different steps claiming the same output is a hard error, surfaced
//! before anything executes.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::label::Label;
use crate::util::hash::{HashError, Hashable, ObjectHash};

/// Identity of a step: truncated hash of its serialized definition.
pub type StepId = ObjectHash;

/// What a step does when executed. Opaque to analysis and scheduling; only
/// the declared inputs/outputs participate in graph construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepKind {
  /// Run a shell command.
  Command {
    cmd: String,
    env: Option<BTreeMap<String, String>>,
    cwd: Option<PathBuf>,
  },
  /// Write fixed contents to the step's single declared output.
  WriteFile { contents: String, executable: bool },
}

/// A step definition, as declared by a rule implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  /// Target whose analysis declared this step.
  pub target: Label,

  /// Short human-readable kind tag for logs and traces, e.g. `"Genrule"`.
  pub mnemonic: String,

  /// Every path this step reads, workspace-relative.
  pub inputs: Vec<PathBuf>,

  /// Every path this step produces, workspace-relative. Never empty.
  pub outputs: Vec<PathBuf>,

  /// Execution behavior.
  pub kind: StepKind,
}

impl Hashable for StepDef {}

impl StepDef {
  /// Content-addressed identity of this definition.
  pub fn id(&self) -> Result<StepId, HashError> {
    self.compute_hash()
  }
}

/// Errors from step graph construction.
#[derive(Debug, thiserror::Error)]
pub enum StepGraphError {
  /// Two different steps declare the same output path.
  #[error("output {path} is declared by two steps: {first} (target {first_target}) and {second} (target {second_target})")]
  DuplicateOutput {
    path: PathBuf,
    first: StepId,
    first_target: Label,
    second: StepId,
    second_target: Label,
  },

  /// A step declares no outputs, so it could never be demanded.
  #[error("step from target {target} declares no outputs")]
  NoOutputs { target: Label },

  #[error("failed to hash step definition: {0}")]
  Hash(#[from] HashError),
}

/// The DAG of steps, keyed by output identity.
///
/// Edges are implicit: step B depends on step A when one of B's declared
/// inputs is one of A's declared outputs.
#[derive(Debug, Default)]
pub struct StepGraph {
  steps: BTreeMap<StepId, StepDef>,
  by_output: BTreeMap<PathBuf, StepId>,
}

impl StepGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a step.
  ///
  /// Idempotent for identical definitions (content-addressed identity);
  /// rejects a definition claiming an output another step already owns.
  pub fn insert(&mut self, def: StepDef) -> Result<StepId, StepGraphError> {
    if def.outputs.is_empty() {
      return Err(StepGraphError::NoOutputs { target: def.target });
    }
    let id = def.id()?;
    if self.steps.contains_key(&id) {
      return Ok(id);
    }
    for output in &def.outputs {
      if let Some(existing) = self.by_output.get(output) {
        let first = self.steps.get(existing).expect("indexed step exists");
        return Err(StepGraphError::DuplicateOutput {
          path: output.clone(),
          first: existing.clone(),
          first_target: first.target.clone(),
          second: id,
          second_target: def.target,
        });
      }
    }
    for output in &def.outputs {
      self.by_output.insert(output.clone(), id.clone());
    }
    self.steps.insert(id.clone(), def);
    Ok(id)
  }

  /// The step producing a path, if any. Paths without a producer are
  /// source files.
  pub fn producer(&self, path: &Path) -> Option<&StepId> {
    self.by_output.get(path)
  }

  pub fn get(&self, id: &StepId) -> Option<&StepDef> {
    self.steps.get(id)
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  /// All step ids, in deterministic order.
  pub fn ids(&self) -> impl Iterator<Item = &StepId> {
    self.steps.keys()
  }

  /// Steps this step depends on: producers of its declared inputs.
  pub fn deps_of(&self, id: &StepId) -> Vec<StepId> {
    let Some(def) = self.steps.get(id) else {
      return Vec::new();
    };
    let mut deps: Vec<StepId> = def
      .inputs
      .iter()
      .filter_map(|input| self.by_output.get(input).cloned())
      .collect();
    deps.sort();
    deps.dedup();
    deps
  }

  /// The minimal set of steps whose outputs transitively satisfy the
  /// requested paths. Requested paths with no producer are returned
  /// separately; the caller decides whether they are legitimate sources.
  pub fn demand_closure(&self, requested: &[PathBuf]) -> (BTreeSet<StepId>, Vec<PathBuf>) {
    let mut closure: BTreeSet<StepId> = BTreeSet::new();
    let mut unproduced: Vec<PathBuf> = Vec::new();
    let mut stack: Vec<StepId> = Vec::new();

    for path in requested {
      match self.by_output.get(path) {
        Some(id) => stack.push(id.clone()),
        None => unproduced.push(path.clone()),
      }
    }

    while let Some(id) = stack.pop() {
      if !closure.insert(id.clone()) {
        continue;
      }
      stack.extend(self.deps_of(&id));
    }

    (closure, unproduced)
  }

  /// Group a set of steps into parallel execution waves. Within a wave,
  /// steps are independent; every dependency (within `subset`) sits in an
  /// earlier wave. Ids within a wave are sorted for determinism.
  pub fn waves(&self, subset: &BTreeSet<StepId>) -> Vec<Vec<StepId>> {
    let mut in_degree: BTreeMap<StepId, usize> = BTreeMap::new();
    for id in subset {
      let deps_in_subset = self.deps_of(id).into_iter().filter(|d| subset.contains(d)).count();
      in_degree.insert(id.clone(), deps_in_subset);
    }

    let mut dependents: BTreeMap<StepId, Vec<StepId>> = BTreeMap::new();
    for id in subset {
      for dep in self.deps_of(id) {
        if subset.contains(&dep) {
          dependents.entry(dep).or_default().push(id.clone());
        }
      }
    }

    let mut remaining: HashSet<StepId> = subset.iter().cloned().collect();
    let mut waves: Vec<Vec<StepId>> = Vec::new();

    while !remaining.is_empty() {
      let mut ready: Vec<StepId> = remaining
        .iter()
        .filter(|id| in_degree.get(*id).copied().unwrap_or(0) == 0)
        .cloned()
        .collect();
      // Step insertion rejects cycles indirectly: an input produced by a
      // later step still resolves through by_output, so a genuine cycle
      // would stall here. Guard rather than loop forever.
      if ready.is_empty() {
        break;
      }
      ready.sort();

      for id in &ready {
        remaining.remove(id);
        if let Some(deps) = dependents.get(id) {
          for dependent in deps.clone() {
            if let Some(deg) = in_degree.get_mut(&dependent) {
              *deg = deg.saturating_sub(1);
            }
          }
        }
      }

      waves.push(ready);
    }

    waves
  }
}

//! Read-only queries over the target and step graphs.
//!
//! Queries run after loading and analysis but never execute anything; they
//! answer "what depends on what" questions for the CLI and for tooling.

use std::path::Path;

use crate::graph::TargetGraph;
use crate::label::Label;
use crate::step::StepGraph;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
  #[error("target {0} is not declared")]
  UnknownTarget(Label),
}

/// Query surface over one invocation's graphs.
pub struct QueryEngine<'a> {
  targets: &'a TargetGraph,
  steps: &'a StepGraph,
}

impl<'a> QueryEngine<'a> {
  pub fn new(targets: &'a TargetGraph, steps: &'a StepGraph) -> Self {
    Self { targets, steps }
  }

  /// Direct or transitive dependencies of a target, sorted.
  pub fn deps(&self, label: &Label, transitive: bool) -> Result<Vec<Label>, QueryError> {
    self.check(label)?;
    if transitive {
      let mut deps: Vec<Label> = self.targets.transitive_deps(label).into_iter().collect();
      deps.sort();
      Ok(deps)
    } else {
      Ok(self.targets.deps(label))
    }
  }

  /// Direct dependents of a target, sorted.
  pub fn rdeps(&self, label: &Label) -> Result<Vec<Label>, QueryError> {
    self.check(label)?;
    Ok(self.targets.rdeps(label))
  }

  /// All targets in topological order.
  pub fn topo_order(&self) -> Vec<Label> {
    self.targets.topo_order()
  }

  /// The target whose step produces a path, if any.
  pub fn producer(&self, path: &Path) -> Option<Label> {
    let id = self.steps.producer(path)?;
    self.steps.get(id).map(|def| def.target.clone())
  }

  /// Output paths of a target's steps, sorted.
  pub fn outputs(&self, label: &Label) -> Result<Vec<std::path::PathBuf>, QueryError> {
    self.check(label)?;
    let mut outputs: Vec<std::path::PathBuf> = self
      .steps
      .ids()
      .filter_map(|id| self.steps.get(id))
      .filter(|def| &def.target == label)
      .flat_map(|def| def.outputs.iter().cloned())
      .collect();
    outputs.sort();
    Ok(outputs)
  }

  fn check(&self, label: &Label) -> Result<(), QueryError> {
    if self.targets.contains(label) {
      Ok(())
    } else {
      Err(QueryError::UnknownTarget(label.clone()))
    }
  }
}

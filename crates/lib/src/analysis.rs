//! The analysis engine: targets in, step graph out.
//!
//! Analysis walks the target graph in dependency waves. Within a wave every
//! target is independent, so rule implementations run concurrently under a
//! parallelism cap; between waves the engine commits providers so the next
//! wave sees its dependencies' results. Per-target results are memoized in
//! an evaluate-or-await cache, so a target reached twice is analyzed once.
//!
//! Step registration and input validation run serially after the waves, in
//! label order, so duplicate-output and missing-input errors are attributed
//! deterministically no matter how the concurrent part interleaved.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::KeyedCache;
use crate::consts::OUT_DIR;
use crate::graph::TargetGraph;
use crate::label::Label;
use crate::provider::ProviderData;
use crate::rule::{RuleCtx, RuleError, RuleImpl, RuleRegistry};
use crate::step::{StepDef, StepGraph, StepGraphError};
use crate::target::TargetDef;

/// Why a target failed analysis.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
  #[error("target {target} names unknown rule '{rule}'")]
  RuleNotFound { target: Label, rule: String },

  #[error(transparent)]
  Rule(#[from] RuleError),

  #[error(transparent)]
  Steps(#[from] StepGraphError),

  #[error("target {target}: step input {path} is neither a source file nor produced by a dependency")]
  MissingInput { target: Label, path: PathBuf },

  #[error("analysis task panicked: {0}")]
  Join(String),
}

/// Providers and steps declared by one analyzed target.
#[derive(Debug)]
pub struct AnalyzedTarget {
  pub providers: ProviderData,
  pub steps: Vec<StepDef>,
}

/// The result of analyzing a target graph.
///
/// Analysis keeps going past individual failures so one broken target
/// reports alongside everything independent of it; dependents of a failed
/// target are skipped, not failed.
#[derive(Debug, Default)]
pub struct AnalysisOutcome {
  /// Providers per successfully analyzed target.
  pub providers: BTreeMap<Label, Arc<ProviderData>>,

  /// Every registered step, with output ownership validated.
  pub steps: StepGraph,

  /// Targets whose analysis failed, with the reason.
  pub failed: BTreeMap<Label, AnalysisError>,

  /// Targets skipped because a dependency failed; value is the failed
  /// dependency they were waiting on.
  pub skipped: BTreeMap<Label, Label>,
}

impl AnalysisOutcome {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }
}

/// Wave-parallel analysis driver.
pub struct Analyzer {
  root: PathBuf,
  parallelism: usize,
  cache: Arc<KeyedCache<Label, Arc<AnalyzedTarget>>>,
}

impl Analyzer {
  pub fn new(root: impl Into<PathBuf>, parallelism: usize) -> Self {
    Self {
      root: root.into(),
      parallelism: parallelism.max(1),
      cache: Arc::new(KeyedCache::new()),
    }
  }

  /// Analyze every target in the graph.
  pub async fn analyze(&self, graph: &TargetGraph, registry: &RuleRegistry) -> AnalysisOutcome {
    let mut outcome = AnalysisOutcome::default();
    let mut declared_steps: BTreeMap<Label, Vec<StepDef>> = BTreeMap::new();
    let semaphore = Arc::new(Semaphore::new(self.parallelism));

    let waves = graph.waves();
    info!(targets = graph.len(), waves = waves.len(), "starting analysis");

    for (wave_idx, wave) in waves.into_iter().enumerate() {
      let mut join_set: JoinSet<(Label, Result<Arc<AnalyzedTarget>, AnalysisError>)> = JoinSet::new();
      let mut spawned: Vec<Label> = Vec::new();
      let mut aborted: Vec<String> = Vec::new();

      for label in wave {
        // A target whose dependency already failed or was skipped never
        // reaches its rule implementation.
        if let Some(blocked_on) = self.blocking_dep(graph, &label, &outcome) {
          debug!(target = %label, dep = %blocked_on, "skipping target, dependency failed");
          outcome.skipped.insert(label, blocked_on);
          continue;
        }

        let def = graph.get(&label).expect("wave label is declared").clone();
        let Some(rule) = registry.get(&def.rule) else {
          outcome.failed.insert(
            label.clone(),
            AnalysisError::RuleNotFound {
              target: label,
              rule: def.rule.clone(),
            },
          );
          continue;
        };

        let deps: BTreeMap<Label, Arc<ProviderData>> = graph
          .deps(&label)
          .into_iter()
          .filter_map(|dep| outcome.providers.get(&dep).map(|p| (dep, p.clone())))
          .collect();

        spawned.push(label.clone());
        let cache = self.cache.clone();
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
          let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
          let result = cache
            .get_or_init(label.clone(), || async { analyze_one(&def, rule.as_ref(), &deps) })
            .await;
          (label, result)
        });
      }

      while let Some(joined) = join_set.join_next().await {
        match joined {
          Ok((label, Ok(analyzed))) => {
            declared_steps.insert(label.clone(), analyzed.steps.clone());
            outcome
              .providers
              .insert(label, Arc::new(analyzed.providers.clone()));
          }
          Ok((label, Err(err))) => {
            warn!(target = %label, error = %err, "target analysis failed");
            outcome.failed.insert(label, err);
          }
          Err(join_err) => {
            warn!(error = %join_err, "analysis task aborted");
            aborted.push(join_err.to_string());
          }
        }
      }

      // A panicked rule implementation yields no (label, result) pair;
      // attribute the abort to whichever spawned targets are otherwise
      // unaccounted for, so the outcome never reports success past it.
      if !aborted.is_empty() {
        let message = aborted.join("; ");
        for label in spawned {
          if !outcome.providers.contains_key(&label) && !outcome.failed.contains_key(&label) {
            outcome.failed.insert(label, AnalysisError::Join(message.clone()));
          }
        }
      }

      debug!(wave = wave_idx, analyzed = outcome.providers.len(), "analysis wave complete");
    }

    self.register_steps(graph, declared_steps, &mut outcome);
    info!(
      analyzed = outcome.providers.len(),
      steps = outcome.steps.len(),
      failed = outcome.failed.len(),
      skipped = outcome.skipped.len(),
      "analysis complete"
    );
    outcome
  }

  /// The first failed or skipped dependency of `label`, if any.
  fn blocking_dep(&self, graph: &TargetGraph, label: &Label, outcome: &AnalysisOutcome) -> Option<Label> {
    for dep in graph.deps(label) {
      if outcome.failed.contains_key(&dep) {
        return Some(dep);
      }
      if let Some(root_cause) = outcome.skipped.get(&dep) {
        return Some(root_cause.clone());
      }
    }
    None
  }

  /// Serially register declared steps and validate their inputs, in label
  /// order for deterministic error attribution.
  fn register_steps(&self, graph: &TargetGraph, declared: BTreeMap<Label, Vec<StepDef>>, outcome: &mut AnalysisOutcome) {
    for (label, steps) in &declared {
      for step in steps {
        if let Err(err) = outcome.steps.insert(step.clone()) {
          outcome.failed.insert(label.clone(), err.into());
          break;
        }
      }
    }

    // An input is legitimate when a step of this target or of a transitive
    // dependency produces it, or when it exists on disk as a source file.
    for (label, steps) in &declared {
      if outcome.failed.contains_key(label) {
        continue;
      }
      let mut available: HashSet<&Path> = HashSet::new();
      for step in steps {
        available.extend(step.outputs.iter().map(PathBuf::as_path));
      }
      for dep in graph.transitive_deps(label) {
        if let Some(dep_steps) = declared.get(&dep) {
          for step in dep_steps {
            available.extend(step.outputs.iter().map(PathBuf::as_path));
          }
        }
      }

      'steps: for step in steps {
        for input in &step.inputs {
          if available.contains(input.as_path()) {
            continue;
          }
          // Paths under the output tree must come from the dependency
          // closure; a file left there by an earlier invocation is not a
          // source, even though it exists on disk.
          if !input.starts_with(OUT_DIR) && self.root.join(input).exists() {
            continue;
          }
          outcome.failed.insert(
            label.clone(),
            AnalysisError::MissingInput {
              target: label.clone(),
              path: input.clone(),
            },
          );
          break 'steps;
        }
      }
    }
  }
}

fn analyze_one(
  def: &TargetDef,
  rule: &dyn RuleImpl,
  deps: &BTreeMap<Label, Arc<ProviderData>>,
) -> Result<Arc<AnalyzedTarget>, AnalysisError> {
  let mut ctx = RuleCtx::new(def, deps);
  rule.analyze(&mut ctx)?;
  let (providers, steps) = ctx.finish();
  debug!(target = %def.label, steps = steps.len(), "analyzed target");
  Ok(Arc::new(AnalyzedTarget { providers, steps }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::target::AttrValue;

  fn label(s: &str) -> Label {
    s.parse().unwrap()
  }

  fn write_file_target(name: &str, contents: &str) -> TargetDef {
    TargetDef {
      label: label(&format!("//app:{}", name)),
      rule: "write_file".to_string(),
      attrs: [
        ("contents".to_string(), AttrValue::String(contents.to_string())),
        ("out".to_string(), AttrValue::String(format!("{}.txt", name))),
      ]
      .into_iter()
      .collect(),
      declared_by: label("//app:BUILD.lua"),
    }
  }

  fn filegroup_target(name: &str, srcs: Vec<AttrValue>) -> TargetDef {
    TargetDef {
      label: label(&format!("//app:{}", name)),
      rule: "filegroup".to_string(),
      attrs: [("srcs".to_string(), AttrValue::List(srcs))].into_iter().collect(),
      declared_by: label("//app:BUILD.lua"),
    }
  }

  #[tokio::test]
  async fn analyzes_chain_and_registers_steps() {
    let graph = TargetGraph::from_targets([
      write_file_target("a", "one"),
      filegroup_target("group", vec![AttrValue::Label(label("//app:a"))]),
    ])
    .unwrap();

    let analyzer = Analyzer::new("/nonexistent-root", 4);
    let outcome = analyzer.analyze(&graph, &RuleRegistry::with_builtins()).await;

    assert!(outcome.is_success(), "failed: {:?}", outcome.failed);
    assert_eq!(outcome.steps.len(), 1);
    assert_eq!(
      outcome.providers[&label("//app:group")].get_set("files").unwrap().materialize(),
      vec!["girder-out/app/a.txt".to_string()]
    );
  }

  #[tokio::test]
  async fn unknown_rule_fails_and_dependents_skip() {
    let broken = TargetDef {
      label: label("//app:broken"),
      rule: "no_such_rule".to_string(),
      attrs: BTreeMap::new(),
      declared_by: label("//app:BUILD.lua"),
    };
    let graph = TargetGraph::from_targets([
      broken,
      filegroup_target("dependent", vec![AttrValue::Label(label("//app:broken"))]),
    ])
    .unwrap();

    let analyzer = Analyzer::new("/nonexistent-root", 4);
    let outcome = analyzer.analyze(&graph, &RuleRegistry::with_builtins()).await;

    assert!(matches!(
      outcome.failed.get(&label("//app:broken")),
      Some(AnalysisError::RuleNotFound { .. })
    ));
    assert_eq!(outcome.skipped.get(&label("//app:dependent")), Some(&label("//app:broken")));
  }

  #[tokio::test]
  async fn duplicate_output_is_attributed_to_second_target_in_label_order() {
    // Both targets write the same output file. The later label loses.
    let mut first = write_file_target("a", "x");
    first.attrs.insert("out".to_string(), AttrValue::String("same.txt".to_string()));
    let mut second = write_file_target("b", "y");
    second.attrs.insert("out".to_string(), AttrValue::String("same.txt".to_string()));

    let graph = TargetGraph::from_targets([first, second]).unwrap();
    let analyzer = Analyzer::new("/nonexistent-root", 4);
    let outcome = analyzer.analyze(&graph, &RuleRegistry::with_builtins()).await;

    assert!(!outcome.failed.contains_key(&label("//app:a")));
    assert!(matches!(
      outcome.failed.get(&label("//app:b")),
      Some(AnalysisError::Steps(StepGraphError::DuplicateOutput { .. }))
    ));
  }

  #[tokio::test]
  async fn missing_input_is_rejected() {
    let def = TargetDef {
      label: label("//app:gen"),
      rule: "genrule".to_string(),
      attrs: [
        ("cmd".to_string(), AttrValue::String("cp $SRCS $OUTS".to_string())),
        (
          "srcs".to_string(),
          AttrValue::List(vec![AttrValue::String("missing.txt".to_string())]),
        ),
        (
          "outs".to_string(),
          AttrValue::List(vec![AttrValue::String("copy.txt".to_string())]),
        ),
      ]
      .into_iter()
      .collect(),
      declared_by: label("//app:BUILD.lua"),
    };

    let graph = TargetGraph::from_targets([def]).unwrap();
    let analyzer = Analyzer::new("/nonexistent-root", 4);
    let outcome = analyzer.analyze(&graph, &RuleRegistry::with_builtins()).await;

    assert!(matches!(
      outcome.failed.get(&label("//app:gen")),
      Some(AnalysisError::MissingInput { path, .. }) if path == &PathBuf::from("app/missing.txt")
    ));
  }

  #[tokio::test]
  async fn panicking_rule_fails_its_target() {
    struct PanickingRule;

    impl RuleImpl for PanickingRule {
      fn analyze(&self, _ctx: &mut RuleCtx<'_>) -> Result<(), RuleError> {
        panic!("rule exploded");
      }
    }

    let mut registry = RuleRegistry::with_builtins();
    registry.register("explode", PanickingRule);

    let def = TargetDef {
      label: label("//app:boom"),
      rule: "explode".to_string(),
      attrs: BTreeMap::new(),
      declared_by: label("//app:BUILD.lua"),
    };
    let graph = TargetGraph::from_targets([def]).unwrap();
    let analyzer = Analyzer::new("/nonexistent-root", 4);
    let outcome = analyzer.analyze(&graph, &registry).await;

    assert!(!outcome.is_success());
    assert!(matches!(
      outcome.failed.get(&label("//app:boom")),
      Some(AnalysisError::Join(_))
    ));
  }

  #[tokio::test]
  async fn stale_output_tree_file_is_not_a_source() {
    use crate::step::StepKind;

    // Declares an input under the output tree that no dependency produces.
    struct StaleInputRule;

    impl RuleImpl for StaleInputRule {
      fn analyze(&self, ctx: &mut RuleCtx<'_>) -> Result<(), RuleError> {
        let out = ctx.output_path("copy.txt");
        ctx.declare_step(
          "Stale",
          vec![PathBuf::from("girder-out/app/stale.txt")],
          vec![out],
          StepKind::Command {
            cmd: "cp $SRCS $OUTS".to_string(),
            env: None,
            cwd: None,
          },
        );
        Ok(())
      }
    }

    let mut registry = RuleRegistry::with_builtins();
    registry.register("stale_input", StaleInputRule);

    // The file exists on disk, left over from an earlier invocation.
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("girder-out/app")).unwrap();
    std::fs::write(root.path().join("girder-out/app/stale.txt"), "old").unwrap();

    let def = TargetDef {
      label: label("//app:copy"),
      rule: "stale_input".to_string(),
      attrs: BTreeMap::new(),
      declared_by: label("//app:BUILD.lua"),
    };
    let graph = TargetGraph::from_targets([def]).unwrap();
    let analyzer = Analyzer::new(root.path(), 4);
    let outcome = analyzer.analyze(&graph, &registry).await;

    assert!(matches!(
      outcome.failed.get(&label("//app:copy")),
      Some(AnalysisError::MissingInput { path, .. }) if path == &PathBuf::from("girder-out/app/stale.txt")
    ));
  }

  #[tokio::test]
  async fn input_produced_by_dependency_is_accepted() {
    let producer = write_file_target("a", "one");
    let consumer = TargetDef {
      label: label("//app:gen"),
      rule: "genrule".to_string(),
      attrs: [
        ("cmd".to_string(), AttrValue::String("cp $SRCS $OUTS".to_string())),
        (
          "srcs".to_string(),
          AttrValue::List(vec![AttrValue::Label(label("//app:a"))]),
        ),
        (
          "outs".to_string(),
          AttrValue::List(vec![AttrValue::String("copy.txt".to_string())]),
        ),
      ]
      .into_iter()
      .collect(),
      declared_by: label("//app:BUILD.lua"),
    };

    let graph = TargetGraph::from_targets([producer, consumer]).unwrap();
    let analyzer = Analyzer::new("/nonexistent-root", 4);
    let outcome = analyzer.analyze(&graph, &RuleRegistry::with_builtins()).await;

    assert!(outcome.is_success(), "failed: {:?}", outcome.failed);
    assert_eq!(outcome.steps.len(), 2);
  }
}

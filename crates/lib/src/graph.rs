//! The target graph: declared targets and their dependency edges.
//!
//! Built once loading completes, when the set of target declarations is
//! final. Provides topological ordering and parallel analysis waves, plus
//! the read-only dependency queries used by the query interface.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::label::Label;
use crate::target::TargetDef;

/// Errors while assembling the target graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
  /// An attribute references a target that was never declared.
  #[error("target {target} depends on {dep}, which is not declared")]
  UnknownDependency { target: Label, dep: Label },

  /// The declared targets form a dependency cycle.
  #[error("target dependency cycle: {}", chain_display(.chain))]
  Cycle { chain: Vec<Label> },
}

fn chain_display(chain: &[Label]) -> String {
  chain.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(" -> ")
}

/// A DAG over target declarations, with edges from dependency to dependent.
#[derive(Debug)]
pub struct TargetGraph {
  graph: DiGraph<Label, ()>,
  nodes: HashMap<Label, NodeIndex>,
  defs: HashMap<Label, TargetDef>,
}

impl TargetGraph {
  /// Build the graph from a finished set of declarations.
  ///
  /// Every referenced dependency must be declared, and the result must be
  /// acyclic; a cycle is reported with the full implicated chain.
  pub fn from_targets(targets: impl IntoIterator<Item = TargetDef>) -> Result<Self, GraphError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    let mut defs = HashMap::new();

    for target in targets {
      let idx = graph.add_node(target.label.clone());
      nodes.insert(target.label.clone(), idx);
      defs.insert(target.label.clone(), target);
    }

    for (label, def) in &defs {
      let dependent_idx = nodes[label];
      for dep in def.dep_labels() {
        let Some(&dep_idx) = nodes.get(&dep) else {
          return Err(GraphError::UnknownDependency {
            target: label.clone(),
            dep,
          });
        };
        // Edge from dependency to dependent.
        graph.add_edge(dep_idx, dependent_idx, ());
      }
    }

    let built = Self { graph, nodes, defs };
    if toposort(&built.graph, None).is_err() {
      return Err(GraphError::Cycle {
        chain: built.find_cycle_chain(),
      });
    }
    Ok(built)
  }

  /// Reconstruct one full cycle for error reporting.
  fn find_cycle_chain(&self) -> Vec<Label> {
    // DFS with an explicit on-path set; the first back edge closes a cycle.
    let mut on_path: Vec<NodeIndex> = Vec::new();
    let mut on_path_set: HashSet<NodeIndex> = HashSet::new();
    let mut done: HashSet<NodeIndex> = HashSet::new();

    fn dfs(
      graph: &DiGraph<Label, ()>,
      node: NodeIndex,
      on_path: &mut Vec<NodeIndex>,
      on_path_set: &mut HashSet<NodeIndex>,
      done: &mut HashSet<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
      on_path.push(node);
      on_path_set.insert(node);
      for next in graph.neighbors_directed(node, Direction::Outgoing) {
        if on_path_set.contains(&next) {
          let start = on_path.iter().position(|&n| n == next).unwrap_or(0);
          let mut chain = on_path[start..].to_vec();
          chain.push(next);
          return Some(chain);
        }
        if !done.contains(&next)
          && let Some(chain) = dfs(graph, next, on_path, on_path_set, done)
        {
          return Some(chain);
        }
      }
      on_path.pop();
      on_path_set.remove(&node);
      done.insert(node);
      None
    }

    for start in self.graph.node_indices() {
      if done.contains(&start) {
        continue;
      }
      if let Some(chain) = dfs(&self.graph, start, &mut on_path, &mut on_path_set, &mut done) {
        return chain.into_iter().map(|idx| self.graph[idx].clone()).collect();
      }
    }
    Vec::new()
  }

  /// Look up a declaration.
  pub fn get(&self, label: &Label) -> Option<&TargetDef> {
    self.defs.get(label)
  }

  /// Whether a target is declared.
  pub fn contains(&self, label: &Label) -> bool {
    self.defs.contains_key(label)
  }

  /// All declared labels, sorted.
  pub fn labels(&self) -> Vec<Label> {
    let mut labels: Vec<Label> = self.defs.keys().cloned().collect();
    labels.sort();
    labels
  }

  /// Number of declared targets.
  pub fn len(&self) -> usize {
    self.defs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.defs.is_empty()
  }

  /// Direct dependencies of a target, sorted.
  pub fn deps(&self, label: &Label) -> Vec<Label> {
    self.neighbors(label, Direction::Incoming)
  }

  /// Direct dependents of a target, sorted.
  pub fn rdeps(&self, label: &Label) -> Vec<Label> {
    self.neighbors(label, Direction::Outgoing)
  }

  fn neighbors(&self, label: &Label, dir: Direction) -> Vec<Label> {
    let Some(&idx) = self.nodes.get(label) else {
      return Vec::new();
    };
    let mut out: Vec<Label> = self
      .graph
      .neighbors_directed(idx, dir)
      .map(|n| self.graph[n].clone())
      .collect();
    out.sort();
    out.dedup();
    out
  }

  /// Labels in topological order, dependencies before dependents, ties
  /// broken by label order for determinism.
  pub fn topo_order(&self) -> Vec<Label> {
    self.waves().into_iter().flatten().collect()
  }

  /// Targets grouped into parallel analysis waves: each wave's targets
  /// depend only on earlier waves. Kahn's algorithm by level; labels within
  /// a wave are sorted.
  pub fn waves(&self) -> Vec<Vec<Label>> {
    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in self.graph.node_indices() {
      in_degree.insert(idx, self.graph.neighbors_directed(idx, Direction::Incoming).count());
    }

    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves: Vec<Vec<Label>> = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|&&idx| in_degree[&idx] == 0).copied().collect();
      // Construction verified acyclicity, so progress is guaranteed.
      debug_assert!(!ready.is_empty());
      if ready.is_empty() {
        break;
      }

      for &idx in &ready {
        remaining.remove(&idx);
        for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      let mut wave: Vec<Label> = ready.into_iter().map(|idx| self.graph[idx].clone()).collect();
      wave.sort();
      waves.push(wave);
    }

    waves
  }

  /// A target's transitive dependency closure, not including itself.
  pub fn transitive_deps(&self, label: &Label) -> HashSet<Label> {
    let mut out = HashSet::new();
    let mut stack = self.deps(label);
    while let Some(dep) = stack.pop() {
      if out.insert(dep.clone()) {
        stack.extend(self.deps(&dep));
      }
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use super::*;
  use crate::target::AttrValue;

  fn label(s: &str) -> Label {
    s.parse().unwrap()
  }

  fn make_target(name: &str, deps: &[&str]) -> TargetDef {
    let mut attrs = BTreeMap::new();
    if !deps.is_empty() {
      attrs.insert(
        "deps".to_string(),
        AttrValue::List(deps.iter().map(|d| AttrValue::Label(label(d))).collect()),
      );
    }
    TargetDef {
      label: label(&format!("//pkg:{}", name)),
      rule: "noop".to_string(),
      attrs,
      declared_by: label("//pkg:BUILD.lua"),
    }
  }

  #[test]
  fn empty_graph() {
    let graph = TargetGraph::from_targets([]).unwrap();
    assert!(graph.is_empty());
    assert!(graph.waves().is_empty());
  }

  #[test]
  fn linear_chain_waves() {
    let graph = TargetGraph::from_targets([
      make_target("a", &[]),
      make_target("b", &["//pkg:a"]),
      make_target("c", &["//pkg:b"]),
    ])
    .unwrap();

    let waves = graph.waves();
    assert_eq!(waves.len(), 3);
    assert_eq!(waves[0], vec![label("//pkg:a")]);
    assert_eq!(waves[1], vec![label("//pkg:b")]);
    assert_eq!(waves[2], vec![label("//pkg:c")]);
  }

  #[test]
  fn diamond_waves_and_queries() {
    let graph = TargetGraph::from_targets([
      make_target("a", &[]),
      make_target("b", &["//pkg:a"]),
      make_target("c", &["//pkg:a"]),
      make_target("d", &["//pkg:b", "//pkg:c"]),
    ])
    .unwrap();

    let waves = graph.waves();
    assert_eq!(waves.len(), 3);
    assert_eq!(waves[1], vec![label("//pkg:b"), label("//pkg:c")]);

    assert_eq!(graph.deps(&label("//pkg:d")), vec![label("//pkg:b"), label("//pkg:c")]);
    assert_eq!(graph.rdeps(&label("//pkg:a")), vec![label("//pkg:b"), label("//pkg:c")]);

    let closure = graph.transitive_deps(&label("//pkg:d"));
    assert_eq!(closure.len(), 3);
    assert!(closure.contains(&label("//pkg:a")));
  }

  #[test]
  fn unknown_dependency_is_an_error() {
    let err = TargetGraph::from_targets([make_target("a", &["//pkg:missing"])]).unwrap_err();
    assert!(matches!(err, GraphError::UnknownDependency { .. }));
    assert!(err.to_string().contains("//pkg:missing"));
  }

  #[test]
  fn cycle_names_the_chain() {
    let err = TargetGraph::from_targets([
      make_target("a", &["//pkg:b"]),
      make_target("b", &["//pkg:a"]),
    ])
    .unwrap_err();

    let GraphError::Cycle { chain } = err else {
      panic!("expected cycle error");
    };
    assert!(chain.contains(&label("//pkg:a")));
    assert!(chain.contains(&label("//pkg:b")));
    // The chain closes on itself.
    assert_eq!(chain.first(), chain.last());
  }

  #[test]
  fn topo_order_respects_dependencies() {
    let graph = TargetGraph::from_targets([
      make_target("b", &["//pkg:a"]),
      make_target("a", &[]),
      make_target("c", &["//pkg:a", "//pkg:b"]),
    ])
    .unwrap();

    let topo = graph.topo_order();
    let pos = |name: &str| topo.iter().position(|l| l == &label(name)).unwrap();
    assert!(pos("//pkg:a") < pos("//pkg:b"));
    assert!(pos("//pkg:b") < pos("//pkg:c"));
  }
}

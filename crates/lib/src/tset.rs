//! Transitive sets: immutable, structurally-shared collections with O(1)
//! union and deterministic traversal orders.
//!
//! A transitive set node holds a sequence of direct elements plus a sequence
//! of child sets. `union` never copies elements; it allocates a single new
//! node referencing both operands as children. Only materialization walks
//! the structure, and its cost is proportional to the number of distinct
//! nodes and elements reached, never to the number of references to them.
//!
//! Traversal is purely structural (child vectors in declaration order), so
//! materializing the same structure twice — in the same process or another
//! one — yields byte-identical sequences. Node addresses are used only for
//! visited-set membership, never for ordering.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Order policy governing materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
  /// Any fixed, reproducible order. Materializes as the preorder walk.
  Unordered,
  /// A node's own elements before its children's, children left to right.
  Preorder,
  /// Children's elements first, then the node's own.
  Postorder,
  /// A node's own elements only after all its children's elements, with
  /// every node visited at most once (shared subgraphs collapsed).
  Topological,
}

impl std::fmt::Display for Order {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Order::Unordered => "unordered",
      Order::Preorder => "preorder",
      Order::Postorder => "postorder",
      Order::Topological => "topological",
    };
    write!(f, "{}", name)
  }
}

/// Errors from transitive-set construction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TsetError {
  /// Union of two sets with different order policies.
  #[error("cannot union transitive sets with order policies {left} and {right}")]
  IncompatibleOrder { left: Order, right: Order },
}

#[derive(Debug)]
struct Node<T> {
  direct: Vec<T>,
  children: Vec<TransitiveSet<T>>,
}

/// An immutable, structurally-shared set-like container.
///
/// Cloning is cheap (an `Arc` bump). Sets are append-only and unioned
/// forward in time: a node's children always exist before the node itself,
/// so reference cycles cannot be constructed.
#[derive(Debug)]
pub struct TransitiveSet<T> {
  order: Order,
  node: Arc<Node<T>>,
}

impl<T> Clone for TransitiveSet<T> {
  fn clone(&self) -> Self {
    Self {
      order: self.order,
      node: Arc::clone(&self.node),
    }
  }
}

impl<T> TransitiveSet<T> {
  /// A set holding only the given direct elements.
  pub fn direct(order: Order, elements: impl IntoIterator<Item = T>) -> Self {
    Self {
      order,
      node: Arc::new(Node {
        direct: elements.into_iter().collect(),
        children: Vec::new(),
      }),
    }
  }

  /// An empty set with the given order policy.
  pub fn empty(order: Order) -> Self {
    Self::direct(order, [])
  }

  /// The set's order policy.
  pub fn order(&self) -> Order {
    self.order
  }

  /// Union two sets in O(1): the result references both operands as
  /// children, copying nothing.
  pub fn union(&self, other: &Self) -> Result<Self, TsetError> {
    if self.order != other.order {
      return Err(TsetError::IncompatibleOrder {
        left: self.order,
        right: other.order,
      });
    }
    Ok(Self {
      order: self.order,
      node: Arc::new(Node {
        direct: Vec::new(),
        children: vec![self.clone(), other.clone()],
      }),
    })
  }

  /// A set with the given direct elements and the given children, in one
  /// node. Equivalent to `direct(..)` unioned with each child, but flatter.
  pub fn with_children(
    order: Order,
    elements: impl IntoIterator<Item = T>,
    children: impl IntoIterator<Item = Self>,
  ) -> Result<Self, TsetError> {
    let children: Vec<Self> = children.into_iter().collect();
    for child in &children {
      if child.order != order {
        return Err(TsetError::IncompatibleOrder {
          left: order,
          right: child.order,
        });
      }
    }
    Ok(Self {
      order,
      node: Arc::new(Node {
        direct: elements.into_iter().collect(),
        children,
      }),
    })
  }

  /// Union any number of sets of one policy.
  pub fn union_all(order: Order, sets: impl IntoIterator<Item = Self>) -> Result<Self, TsetError> {
    Self::with_children(order, [], sets)
  }

  /// Number of distinct nodes reachable from this set. Shared subgraphs
  /// count once. Primarily useful for asserting structural sharing.
  pub fn node_count(&self) -> usize {
    let mut visited: HashSet<*const Node<T>> = HashSet::new();
    let mut stack = vec![&self.node];
    while let Some(node) = stack.pop() {
      if !visited.insert(Arc::as_ptr(node)) {
        continue;
      }
      for child in &node.children {
        stack.push(&child.node);
      }
    }
    visited.len()
  }

  fn ptr(&self) -> *const Node<T> {
    Arc::as_ptr(&self.node)
  }

  /// Whether both sets share the same root node.
  pub fn same_node(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.node, &other.node)
  }
}

impl<T: Clone + Eq + Hash> TransitiveSet<T> {
  /// Flatten the set into an ordered sequence per the order policy,
  /// removing duplicate elements by first occurrence.
  ///
  /// This is the single point where cost is proportional to the total
  /// distinct element count; every node is visited at most once.
  pub fn materialize(&self) -> Vec<T> {
    match self.order {
      Order::Unordered | Order::Preorder => self.walk_preorder(),
      Order::Postorder | Order::Topological => self.walk_postorder(),
    }
  }

  fn walk_preorder(&self) -> Vec<T> {
    let mut out = Vec::new();
    let mut seen: HashSet<T> = HashSet::new();
    let mut visited: HashSet<*const Node<T>> = HashSet::new();
    let mut stack: Vec<&TransitiveSet<T>> = vec![self];

    while let Some(set) = stack.pop() {
      if !visited.insert(set.ptr()) {
        continue;
      }
      for element in &set.node.direct {
        if seen.insert(element.clone()) {
          out.push(element.clone());
        }
      }
      // Reversed so the leftmost child is popped first.
      for child in set.node.children.iter().rev() {
        stack.push(child);
      }
    }
    out
  }

  fn walk_postorder(&self) -> Vec<T> {
    enum Frame<'a, T> {
      Enter(&'a TransitiveSet<T>),
      Emit(&'a TransitiveSet<T>),
    }

    let mut out = Vec::new();
    let mut seen: HashSet<T> = HashSet::new();
    let mut visited: HashSet<*const Node<T>> = HashSet::new();
    let mut stack = vec![Frame::Enter(self)];

    while let Some(frame) = stack.pop() {
      match frame {
        Frame::Enter(set) => {
          if !visited.insert(set.ptr()) {
            continue;
          }
          stack.push(Frame::Emit(set));
          for child in set.node.children.iter().rev() {
            stack.push(Frame::Enter(child));
          }
        }
        Frame::Emit(set) => {
          for element in &set.node.direct {
            if seen.insert(element.clone()) {
              out.push(element.clone());
            }
          }
        }
      }
    }
    out
  }
}

impl<T> Drop for TransitiveSet<T> {
  /// Iterative teardown. Long union chains would otherwise recurse through
  /// the default drop glue one node per stack frame.
  fn drop(&mut self) {
    let mut stack: Vec<TransitiveSet<T>> = Vec::new();
    if let Some(node) = Arc::get_mut(&mut self.node) {
      stack.append(&mut node.children);
    }
    while let Some(mut set) = stack.pop() {
      if let Some(node) = Arc::get_mut(&mut set.node) {
        stack.append(&mut node.children);
      }
    }
  }
}

impl<T: PartialEq> PartialEq for TransitiveSet<T> {
  /// Structural equality: same order policy, same graph shape, same
  /// elements. Two structurally different sets that happen to materialize
  /// to the same sequence compare unequal.
  fn eq(&self, other: &Self) -> bool {
    self.order == other.order && node_eq(&self.node, &other.node)
  }
}

impl<T: Eq> Eq for TransitiveSet<T> {}

// Iterative for the same reason as `Drop` and the walks: union chains can
// be deep enough to overflow a recursive comparison.
fn node_eq<T: PartialEq>(a: &Arc<Node<T>>, b: &Arc<Node<T>>) -> bool {
  let mut stack: Vec<(&Arc<Node<T>>, &Arc<Node<T>>)> = vec![(a, b)];
  while let Some((a, b)) = stack.pop() {
    if Arc::ptr_eq(a, b) {
      continue;
    }
    if a.direct != b.direct || a.children.len() != b.children.len() {
      return false;
    }
    for (x, y) in a.children.iter().zip(&b.children) {
      if x.order != y.order {
        return false;
      }
      stack.push((&x.node, &y.node));
    }
  }
  true
}

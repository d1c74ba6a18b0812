//! Target declarations.
//!
//! A target is a named, attributed instance of a rule within a package,
//! produced by macro expansion at load time. Attribute values are literals,
//! nested lists/dicts, or label references to other targets; label references
//! are what induce edges in the target graph.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::label::Label;

/// An attribute value on a target declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
  String(String),
  Int(i64),
  Bool(bool),
  List(Vec<AttrValue>),
  Dict(BTreeMap<String, AttrValue>),
  /// A reference to another target; resolved to that target's analysis
  /// result before the rule implementation runs.
  Label(Label),
}

impl AttrValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      AttrValue::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[AttrValue]> {
    match self {
      AttrValue::List(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_label(&self) -> Option<&Label> {
    match self {
      AttrValue::Label(label) => Some(label),
      _ => None,
    }
  }
}

/// A declared target: label, rule identifier, attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDef {
  /// The target's label within its package.
  pub label: Label,

  /// Name of the rule whose implementation analyzes this target.
  pub rule: String,

  /// Attribute name to value.
  pub attrs: BTreeMap<String, AttrValue>,

  /// Module that declared this target, for error attribution.
  pub declared_by: Label,
}

impl TargetDef {
  /// All target labels referenced from this target's attributes, in
  /// deterministic attribute order. These are the target's dependencies.
  pub fn dep_labels(&self) -> Vec<Label> {
    let mut deps = Vec::new();
    for value in self.attrs.values() {
      collect_labels(value, &mut deps);
    }
    deps.sort();
    deps.dedup();
    deps
  }

  pub fn attr(&self, name: &str) -> Option<&AttrValue> {
    self.attrs.get(name)
  }
}

/// Recursively collect label references from nested attribute values.
fn collect_labels(value: &AttrValue, deps: &mut Vec<Label>) {
  match value {
    AttrValue::Label(label) => deps.push(label.clone()),
    AttrValue::List(items) => {
      for item in items {
        collect_labels(item, deps);
      }
    }
    AttrValue::Dict(map) => {
      for item in map.values() {
        collect_labels(item, deps);
      }
    }
    AttrValue::String(_) | AttrValue::Int(_) | AttrValue::Bool(_) => {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn label(s: &str) -> Label {
    s.parse().unwrap()
  }

  #[test]
  fn dep_labels_walks_nested_values() {
    let mut attrs = BTreeMap::new();
    attrs.insert("direct".to_string(), AttrValue::Label(label("//a:x")));
    attrs.insert(
      "nested".to_string(),
      AttrValue::List(vec![
        AttrValue::Label(label("//b:y")),
        AttrValue::Dict(
          [("inner".to_string(), AttrValue::Label(label("//c:z")))]
            .into_iter()
            .collect(),
        ),
      ]),
    );
    attrs.insert("literal".to_string(), AttrValue::String("//not-a-dep:n".to_string()));

    let target = TargetDef {
      label: label("//pkg:t"),
      rule: "noop".to_string(),
      attrs,
      declared_by: label("//pkg:BUILD.lua"),
    };

    assert_eq!(target.dep_labels(), vec![label("//a:x"), label("//b:y"), label("//c:z")]);
  }

  #[test]
  fn dep_labels_dedups() {
    let mut attrs = BTreeMap::new();
    attrs.insert(
      "deps".to_string(),
      AttrValue::List(vec![
        AttrValue::Label(label("//a:x")),
        AttrValue::Label(label("//a:x")),
      ]),
    );
    let target = TargetDef {
      label: label("//pkg:t"),
      rule: "noop".to_string(),
      attrs,
      declared_by: label("//pkg:BUILD.lua"),
    };
    assert_eq!(target.dep_labels(), vec![label("//a:x")]);
  }
}

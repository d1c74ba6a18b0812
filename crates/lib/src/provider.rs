//! Provider data: what a target's analysis exposes to its dependents.
//!
//! A rule implementation returns a `ProviderData` map for its target.
//! Dependents see that map in place of the raw label reference. Values are
//! either plain literals or transitive sets, which is how large aggregates
//! (flag lists, file lists) flow up the graph without copying.

use std::collections::BTreeMap;

use crate::tset::TransitiveSet;

/// A single provider value.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderValue {
  String(String),
  Int(i64),
  Bool(bool),
  List(Vec<ProviderValue>),
  /// A structurally-shared aggregate built from this target's own values
  /// and its dependencies' sets.
  Set(TransitiveSet<String>),
}

impl ProviderValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      ProviderValue::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_set(&self) -> Option<&TransitiveSet<String>> {
    match self {
      ProviderValue::Set(set) => Some(set),
      _ => None,
    }
  }
}

/// Named provider values exposed by one analyzed target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderData {
  values: BTreeMap<String, ProviderValue>,
}

impl ProviderData {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, name: impl Into<String>, value: ProviderValue) {
    self.values.insert(name.into(), value);
  }

  pub fn get(&self, name: &str) -> Option<&ProviderValue> {
    self.values.get(name)
  }

  pub fn get_set(&self, name: &str) -> Option<&TransitiveSet<String>> {
    self.get(name).and_then(ProviderValue::as_set)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &ProviderValue)> {
    self.values.iter()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tset::Order;

  #[test]
  fn insert_and_get() {
    let mut data = ProviderData::new();
    data.insert("kind", ProviderValue::String("library".to_string()));
    data.insert(
      "flags",
      ProviderValue::Set(TransitiveSet::direct(Order::Preorder, ["-O2".to_string()])),
    );

    assert_eq!(data.get("kind").and_then(ProviderValue::as_str), Some("library"));
    assert_eq!(data.get_set("flags").unwrap().materialize(), vec!["-O2".to_string()]);
    assert!(data.get("missing").is_none());
  }
}

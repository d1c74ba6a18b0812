//! Labels identifying extension modules and targets.
//!
//! A label has the form `//package/path:name`. The package path locates a
//! directory under the workspace root; the name identifies either a target
//! declared in that package or an extension module file (when it ends in
//! `.lua`). Labels are the stable keys for the module cache, the target
//! graph, and user-facing error reporting.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::consts::MODULE_EXT;

/// Error while parsing a label.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LabelError {
  #[error("label '{0}' must start with '//'")]
  MissingRootMarker(String),

  #[error("label '{0}' must contain exactly one ':' separating package and name")]
  MissingName(String),

  #[error("label '{0}' has an empty name")]
  EmptyName(String),

  #[error("label '{0}' contains an invalid character {1:?}")]
  InvalidCharacter(String, char),
}

/// A `//package/path:name` identifier.
///
/// Labels order lexicographically by `(package, name)`, which keeps every
/// BTreeMap keyed by label deterministic to iterate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
  package: String,
  name: String,
}

impl Label {
  /// Construct a label from already-validated parts.
  pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      package: package.into(),
      name: name.into(),
    }
  }

  /// Parse an absolute label (`//pkg:name`) or a package-relative one
  /// (`:name`), resolved against `package`.
  pub fn parse_in_package(s: &str, package: &str) -> Result<Self, LabelError> {
    if let Some(name) = s.strip_prefix(':') {
      if name.is_empty() {
        return Err(LabelError::EmptyName(s.to_string()));
      }
      validate_segment(s, name)?;
      return Ok(Self::new(package, name));
    }
    s.parse()
  }

  /// The package path, without the leading `//`.
  pub fn package(&self) -> &str {
    &self.package
  }

  /// The target or module name within the package.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Whether this label names an extension module file.
  pub fn is_module(&self) -> bool {
    self.name.ends_with(MODULE_EXT)
  }

  /// File-system path of the module or source file this label names,
  /// relative to the workspace root.
  pub fn to_path(&self, root: &Path) -> PathBuf {
    if self.package.is_empty() {
      root.join(&self.name)
    } else {
      root.join(&self.package).join(&self.name)
    }
  }

  /// A sibling label in the same package.
  pub fn sibling(&self, name: impl Into<String>) -> Self {
    Self::new(self.package.clone(), name)
  }
}

impl FromStr for Label {
  type Err = LabelError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let rest = s
      .strip_prefix("//")
      .ok_or_else(|| LabelError::MissingRootMarker(s.to_string()))?;

    let (package, name) = rest.split_once(':').ok_or_else(|| LabelError::MissingName(s.to_string()))?;
    if name.is_empty() {
      return Err(LabelError::EmptyName(s.to_string()));
    }
    validate_segment(s, package)?;
    validate_segment(s, name)?;

    Ok(Self::new(package, name))
  }
}

impl std::fmt::Display for Label {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "//{}:{}", self.package, self.name)
  }
}

/// Reject characters that would make labels ambiguous as map keys or
/// dangerous as relative paths.
fn validate_segment(label: &str, segment: &str) -> Result<(), LabelError> {
  for ch in segment.chars() {
    let ok = ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '/' | '+');
    if !ok {
      return Err(LabelError::InvalidCharacter(label.to_string(), ch));
    }
  }
  if segment.split('/').any(|part| part == "..") {
    return Err(LabelError::InvalidCharacter(label.to_string(), '.'));
  }
  Ok(())
}

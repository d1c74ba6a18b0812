//! Hashing utilities for content-addressed identities and fingerprints.
//!
//! This module provides:
//! - `ObjectHash`: a truncated 20-character hash identifying definitions
//! - `ContentHash`: a full 64-character hash for content fingerprints
//! - `hash_file()` / `hash_bytes()`: input content hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A content-addressed hash identifying a unique definition.
///
/// The hash is a 20-character truncated SHA-256 of the JSON-serialized
/// struct. This provides sufficient collision resistance while keeping
/// identifiers readable in logs and reports.
///
/// # Format
///
/// A lowercase hexadecimal string, e.g., `"a1b2c3d4e5f6789012ab"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Identity of any serializable definition: SHA-256 over its canonical
/// JSON form, truncated for readability.
pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_string(self)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    let full = format!("{:x}", hasher.finalize());
    Ok(ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string()))
  }
}

/// A full 64-character SHA-256 hash for content fingerprints.
///
/// Unlike `ObjectHash`, which is truncated for identities, `ContentHash`
/// carries the full hash for maximum collision resistance when deciding
/// whether a step's inputs changed between invocations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error while hashing input files.
#[derive(Debug, thiserror::Error)]
pub enum FileHashError {
  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },
}

/// Hash a file's contents.
///
/// Returns the full 64-character SHA-256 hash of the file.
pub fn hash_file(path: &Path) -> Result<ContentHash, FileHashError> {
  let mut file = fs::File::open(path).map_err(|e| FileHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| FileHashError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash arbitrary bytes.
///
/// Returns the full 64-character SHA-256 hash.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  #[derive(Serialize)]
  struct Sample {
    name: String,
    value: u32,
  }

  impl Hashable for Sample {}

  #[test]
  fn object_hash_is_stable() {
    let a = Sample {
      name: "x".to_string(),
      value: 7,
    };
    let b = Sample {
      name: "x".to_string(),
      value: 7,
    };
    assert_eq!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
  }

  #[test]
  fn object_hash_changes_with_content() {
    let a = Sample {
      name: "x".to_string(),
      value: 7,
    };
    let b = Sample {
      name: "x".to_string(),
      value: 8,
    };
    assert_ne!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
  }

  #[test]
  fn object_hash_has_prefix_length() {
    let a = Sample {
      name: "y".to_string(),
      value: 1,
    };
    assert_eq!(a.compute_hash().unwrap().0.len(), OBJ_HASH_PREFIX_LEN);
  }

  #[test]
  fn hash_file_works() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("test.txt");
    fs::write(&file_path, "hello world").unwrap();

    let hash = hash_file(&file_path).unwrap();
    assert_eq!(hash.0.len(), 64);

    // Same content = same hash
    let hash2 = hash_file(&file_path).unwrap();
    assert_eq!(hash, hash2);
  }

  #[test]
  fn hash_file_missing_errors() {
    let temp = tempdir().unwrap();
    let result = hash_file(&temp.path().join("missing.txt"));
    assert!(matches!(result, Err(FileHashError::ReadFile { .. })));
  }

  #[test]
  fn hash_bytes_matches_file() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("test.txt");
    fs::write(&file_path, "content").unwrap();

    assert_eq!(hash_file(&file_path).unwrap(), hash_bytes(b"content"));
  }
}

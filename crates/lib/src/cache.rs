//! Evaluate-or-await caches.
//!
//! Two caches back the engine. `KeyedCache` is the in-memory coalescing
//! cache used for per-target analysis results: the first requester computes,
//! concurrent requesters for the same key await the same computation, and a
//! failed computation leaves no entry behind. `StepCache` records step
//! fingerprints across invocations, optionally persisted as one small JSON
//! file per step under a state directory.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::step::StepId;
use crate::util::hash::ObjectHash;

/// A concurrent memoization cache keyed by `K`.
///
/// `get_or_init` coalesces concurrent computations for the same key into
/// one; the losers await the winner's result. Errors are returned to the
/// caller but never committed, so a later request retries.
pub struct KeyedCache<K, V> {
  cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for KeyedCache<K, V> {
  fn default() -> Self {
    Self {
      cells: Mutex::new(HashMap::new()),
    }
  }
}

impl<K, V> KeyedCache<K, V>
where
  K: Eq + Hash + Clone,
  V: Clone,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Get the cached value for `key`, computing it with `init` if absent.
  pub async fn get_or_init<F, Fut, E>(&self, key: K, init: F) -> Result<V, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
  {
    let cell = {
      let mut cells = self.cells.lock().expect("cache lock poisoned");
      cells.entry(key).or_insert_with(|| Arc::new(OnceCell::new())).clone()
    };
    cell.get_or_try_init(init).await.cloned()
  }

  /// The cached value, if a computation for `key` has completed.
  pub fn get(&self, key: &K) -> Option<V> {
    let cells = self.cells.lock().expect("cache lock poisoned");
    cells.get(key).and_then(|cell| cell.get().cloned())
  }

  /// Number of completed entries.
  pub fn len(&self) -> usize {
    let cells = self.cells.lock().expect("cache lock poisoned");
    cells.values().filter(|cell| cell.initialized()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Fingerprint record for one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
  /// Combined hash of the step definition and its input file contents at
  /// the time the step last ran successfully.
  pub fingerprint: ObjectHash,
}

#[derive(Debug, thiserror::Error)]
pub enum StepCacheError {
  #[error("failed to read step record {path}: {message}")]
  ReadRecord { path: PathBuf, message: String },

  #[error("failed to write step record {path}: {message}")]
  WriteRecord { path: PathBuf, message: String },

  #[error("step record {path} is not valid JSON: {message}")]
  ParseRecord { path: PathBuf, message: String },
}

/// Step fingerprints, in memory with optional on-disk persistence.
///
/// Each step gets one tiny JSON file named by its id. Records are loaded
/// lazily per lookup rather than scanning the directory up front.
#[derive(Debug, Default)]
pub struct StepCache {
  records: Mutex<HashMap<StepId, StepRecord>>,
  state_dir: Option<PathBuf>,
}

impl StepCache {
  /// A purely in-memory cache. Every step misses on the first invocation.
  pub fn in_memory() -> Self {
    Self::default()
  }

  /// A cache persisted under `state_dir`, one JSON file per step id.
  pub fn persistent(state_dir: impl Into<PathBuf>) -> Self {
    Self {
      records: Mutex::new(HashMap::new()),
      state_dir: Some(state_dir.into()),
    }
  }

  fn record_path(&self, id: &StepId) -> Option<PathBuf> {
    self.state_dir.as_ref().map(|dir| dir.join(format!("{id}.json")))
  }

  /// Look up the recorded fingerprint for a step, falling back to disk.
  pub fn lookup(&self, id: &StepId) -> Result<Option<StepRecord>, StepCacheError> {
    {
      let records = self.records.lock().expect("cache lock poisoned");
      if let Some(record) = records.get(id) {
        return Ok(Some(record.clone()));
      }
    }
    let Some(path) = self.record_path(id) else {
      return Ok(None);
    };
    if !path.exists() {
      return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| StepCacheError::ReadRecord {
      path: path.clone(),
      message: e.to_string(),
    })?;
    let record: StepRecord = serde_json::from_str(&contents).map_err(|e| StepCacheError::ParseRecord {
      path,
      message: e.to_string(),
    })?;
    let mut records = self.records.lock().expect("cache lock poisoned");
    records.insert(id.clone(), record.clone());
    Ok(Some(record))
  }

  /// Record a step's fingerprint after successful execution.
  pub fn record(&self, id: &StepId, record: StepRecord) -> Result<(), StepCacheError> {
    if let Some(path) = self.record_path(id) {
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StepCacheError::WriteRecord {
          path: path.clone(),
          message: e.to_string(),
        })?;
      }
      let contents = serde_json::to_string_pretty(&record).map_err(|e| StepCacheError::WriteRecord {
        path: path.clone(),
        message: e.to_string(),
      })?;
      std::fs::write(&path, contents).map_err(|e| StepCacheError::WriteRecord {
        path: path.clone(),
        message: e.to_string(),
      })?;
      debug!(step = %id, path = %path.display(), "recorded step fingerprint");
    }
    let mut records = self.records.lock().expect("cache lock poisoned");
    records.insert(id.clone(), record);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  #[tokio::test]
  async fn computes_once_per_key() {
    let cache: KeyedCache<String, u32> = KeyedCache::new();
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
      let value = cache
        .get_or_init("k".to_string(), || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok::<_, String>(7)
        })
        .await
        .unwrap();
      assert_eq!(value, 7);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
  }

  #[tokio::test]
  async fn errors_are_not_committed() {
    let cache: KeyedCache<String, u32> = KeyedCache::new();

    let err = cache
      .get_or_init("k".to_string(), || async { Err::<u32, _>("boom".to_string()) })
      .await
      .unwrap_err();
    assert_eq!(err, "boom");
    assert!(cache.get(&"k".to_string()).is_none());

    // A later request retries and can succeed.
    let value = cache
      .get_or_init("k".to_string(), || async { Ok::<_, String>(9) })
      .await
      .unwrap();
    assert_eq!(value, 9);
  }

  #[tokio::test]
  async fn concurrent_requests_coalesce() {
    let cache: Arc<KeyedCache<String, u32>> = Arc::new(KeyedCache::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
      let cache = cache.clone();
      let calls = calls.clone();
      handles.push(tokio::spawn(async move {
        cache
          .get_or_init("k".to_string(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok::<_, String>(42)
          })
          .await
          .unwrap()
      }));
    }
    for handle in handles {
      assert_eq!(handle.await.unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn step_cache_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let id = ObjectHash("abc123".to_string());
    let record = StepRecord {
      fingerprint: ObjectHash("fp0".to_string()),
    };

    let cache = StepCache::persistent(dir.path());
    assert!(cache.lookup(&id).unwrap().is_none());
    cache.record(&id, record.clone()).unwrap();
    assert_eq!(cache.lookup(&id).unwrap(), Some(record.clone()));

    // A fresh cache over the same directory sees the record.
    let reopened = StepCache::persistent(dir.path());
    assert_eq!(reopened.lookup(&id).unwrap(), Some(record));
  }

  #[test]
  fn in_memory_cache_does_not_touch_disk() {
    let cache = StepCache::in_memory();
    let id = ObjectHash("abc123".to_string());
    assert!(cache.lookup(&id).unwrap().is_none());
    cache
      .record(
        &id,
        StepRecord {
          fingerprint: ObjectHash("fp1".to_string()),
        },
      )
      .unwrap();
    assert!(cache.lookup(&id).unwrap().is_some());
  }
}

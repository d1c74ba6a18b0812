//! Demand-driven step scheduling.
//!
//! Given the step graph and a set of requested output paths, the scheduler
//! computes the minimal closure of steps that produce them, orders it into
//! dependency waves, and runs each wave concurrently under a parallelism
//! cap. Steps whose fingerprint (definition plus input contents) matches
//! the previous run and whose outputs still exist are skipped as cache
//! hits. On failure the default is to drain: everything not depending on a
//! failed step still runs, and dependents are reported as skipped.

mod executor;

pub use executor::{ExecContext, LocalExecutor, RecordingExecutor, StepExecutor};

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{StepCache, StepCacheError, StepRecord};
use crate::step::{StepDef, StepGraph, StepId};
use crate::util::hash::{hash_file, ContentHash, HashError, Hashable, ObjectHash};

/// Execution tuning for one invocation.
#[derive(Debug, Clone)]
pub struct ExecOptions {
  /// Maximum number of steps running at once.
  pub parallelism: usize,

  /// Per-step wall-clock limit.
  pub timeout: Option<Duration>,

  /// Stop scheduling new steps after the first failure instead of
  /// draining independent work.
  pub fail_fast: bool,
}

impl Default for ExecOptions {
  fn default() -> Self {
    Self {
      parallelism: 8,
      timeout: None,
      fail_fast: false,
    }
  }
}

/// Why a step (or the whole schedule) failed.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
  #[error("step {step} failed with exit code {code:?}: {stderr}")]
  StepFailed {
    step: StepId,
    code: Option<i32>,
    stderr: String,
  },

  #[error("step {step} exceeded its {limit:?} time limit")]
  Timeout { step: StepId, limit: Duration },

  #[error("step {step}: {message}")]
  Io { step: StepId, message: String },

  #[error("step {step} completed without producing declared output {path}")]
  OutputNotProduced { step: StepId, path: PathBuf },

  #[error("requested output {path} has no producing step and does not exist on disk")]
  NoProducer { path: PathBuf },

  #[error(transparent)]
  Cache(#[from] StepCacheError),

  #[error("failed to fingerprint step: {0}")]
  Fingerprint(#[from] HashError),

  #[error("execution task panicked: {0}")]
  Join(String),
}

/// What one invocation's execution phase did.
#[derive(Debug, Default)]
pub struct BuildOutcome {
  /// Requested paths now present on disk.
  pub produced: Vec<PathBuf>,

  /// Steps that actually ran, in completion order.
  pub executed: Vec<StepId>,

  /// Steps skipped because their fingerprint was unchanged.
  pub cached: Vec<StepId>,

  /// Steps that ran and failed.
  pub failed: BTreeMap<StepId, ExecError>,

  /// Steps never attempted; value is the failed step they depend on.
  pub skipped: BTreeMap<StepId, StepId>,
}

impl BuildOutcome {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }
}

/// Inputs to a step's up-to-date check. Hashing this struct yields the
/// fingerprint recorded after a successful run.
#[derive(Serialize)]
struct Fingerprint<'a> {
  def: &'a StepId,
  inputs: Vec<(String, &'a ContentHash)>,
}

impl Hashable for Fingerprint<'_> {}

/// Wave-parallel, cache-aware step scheduler.
pub struct Scheduler {
  ctx: ExecContext,
  options: ExecOptions,
  cache: Arc<StepCache>,
  executor: Arc<dyn StepExecutor>,
}

impl Scheduler {
  pub fn new(root: impl Into<PathBuf>, options: ExecOptions, cache: Arc<StepCache>, executor: Arc<dyn StepExecutor>) -> Self {
    Self {
      ctx: ExecContext { root: root.into() },
      options,
      cache,
      executor,
    }
  }

  /// Build the requested outputs.
  ///
  /// A requested path with no producing step must already exist on disk
  /// (a source file); otherwise the schedule is rejected before any step
  /// runs.
  pub async fn build(&self, steps: &StepGraph, requested: &[PathBuf]) -> Result<BuildOutcome, ExecError> {
    let (closure, unproduced) = steps.demand_closure(requested);
    for path in unproduced {
      if !self.ctx.root.join(&path).exists() {
        return Err(ExecError::NoProducer { path });
      }
    }

    let waves = steps.waves(&closure);
    info!(
      requested = requested.len(),
      steps = closure.len(),
      waves = waves.len(),
      "starting execution"
    );

    let mut outcome = BuildOutcome::default();
    let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
    let mut halted = false;

    for wave in waves {
      if halted {
        self.skip_remaining(steps, &wave, &mut outcome);
        continue;
      }

      let mut join_set: JoinSet<(StepId, Result<bool, ExecError>)> = JoinSet::new();
      let mut spawned: Vec<StepId> = Vec::new();
      let mut aborted: Vec<String> = Vec::new();

      for id in wave {
        if let Some(cause) = self.blocking_dep(steps, &id, &outcome) {
          debug!(step = %id, dep = %cause, "skipping step, dependency failed");
          outcome.skipped.insert(id, cause);
          continue;
        }

        spawned.push(id.clone());
        let def = steps.get(&id).expect("closure step exists").clone();
        let ctx = self.ctx.clone();
        let options = self.options.clone();
        let cache = self.cache.clone();
        let executor = self.executor.clone();
        let semaphore = semaphore.clone();

        join_set.spawn(async move {
          let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
          let result = run_step(&ctx, &options, &cache, executor.as_ref(), &id, &def).await;
          (id, result)
        });
      }

      while let Some(joined) = join_set.join_next().await {
        match joined {
          Ok((id, Ok(true))) => outcome.executed.push(id),
          Ok((id, Ok(false))) => {
            debug!(step = %id, "step up to date");
            outcome.cached.push(id);
          }
          Ok((id, Err(err))) => {
            warn!(step = %id, error = %err, "step failed");
            outcome.failed.insert(id, err);
            if self.options.fail_fast {
              halted = true;
            }
          }
          Err(join_err) => {
            warn!(error = %join_err, "execution task aborted");
            aborted.push(join_err.to_string());
            if self.options.fail_fast {
              halted = true;
            }
          }
        }
      }

      // A panicked task yields no (id, result) pair; attribute the abort to
      // whichever spawned steps are otherwise unaccounted for, so the
      // outcome never reports success past a vanished step.
      if !aborted.is_empty() {
        let message = aborted.join("; ");
        for id in spawned {
          let accounted = outcome.executed.contains(&id)
            || outcome.cached.contains(&id)
            || outcome.failed.contains_key(&id);
          if !accounted {
            outcome.failed.insert(id, ExecError::Join(message.clone()));
          }
        }
      }
    }

    outcome.executed.sort();
    outcome.cached.sort();

    // A requested path counts as produced only when every step in its
    // closure completed; a stale file left on disk by an earlier invocation
    // is not a result of this one.
    let done: BTreeSet<&StepId> = outcome.executed.iter().chain(outcome.cached.iter()).collect();
    for path in requested {
      let satisfied = match steps.producer(path) {
        Some(_) => {
          let (closure, _) = steps.demand_closure(std::slice::from_ref(path));
          closure.iter().all(|id| done.contains(id))
        }
        // No producer: a source file, verified to exist up front.
        None => true,
      };
      if satisfied && self.ctx.root.join(path).exists() {
        outcome.produced.push(path.clone());
      }
    }

    info!(
      executed = outcome.executed.len(),
      cached = outcome.cached.len(),
      failed = outcome.failed.len(),
      skipped = outcome.skipped.len(),
      "execution complete"
    );
    Ok(outcome)
  }

  /// The first dependency of `id` that failed or was skipped, if any.
  fn blocking_dep(&self, steps: &StepGraph, id: &StepId, outcome: &BuildOutcome) -> Option<StepId> {
    for dep in steps.deps_of(id) {
      if outcome.failed.contains_key(&dep) {
        return Some(dep);
      }
      if let Some(root_cause) = outcome.skipped.get(&dep) {
        return Some(root_cause.clone());
      }
    }
    None
  }

  /// Mark an entire wave skipped after a fail-fast halt.
  fn skip_remaining(&self, steps: &StepGraph, wave: &[StepId], outcome: &mut BuildOutcome) {
    for id in wave {
      let cause = self
        .blocking_dep(steps, id, outcome)
        .or_else(|| outcome.failed.keys().next().cloned())
        .unwrap_or_else(|| id.clone());
      outcome.skipped.insert(id.clone(), cause);
    }
  }
}

/// Run one step unless its fingerprint says it is already up to date.
/// Returns `true` when the step actually executed.
async fn run_step(
  ctx: &ExecContext,
  options: &ExecOptions,
  cache: &StepCache,
  executor: &dyn StepExecutor,
  id: &StepId,
  def: &StepDef,
) -> Result<bool, ExecError> {
  let fingerprint = compute_fingerprint(ctx, id, def)?;

  if let Some(record) = cache.lookup(id)?
    && record.fingerprint == fingerprint
    && def.outputs.iter().all(|out| ctx.root.join(out).exists())
  {
    return Ok(false);
  }

  match options.timeout {
    Some(limit) => match tokio::time::timeout(limit, executor.execute(ctx, id, def)).await {
      Ok(result) => result?,
      Err(_) => {
        return Err(ExecError::Timeout {
          step: id.clone(),
          limit,
        });
      }
    },
    None => executor.execute(ctx, id, def).await?,
  }

  for output in &def.outputs {
    if !ctx.root.join(output).exists() {
      return Err(ExecError::OutputNotProduced {
        step: id.clone(),
        path: output.clone(),
      });
    }
  }

  cache.record(id, StepRecord { fingerprint })?;
  Ok(true)
}

/// Hash the step definition together with the current contents of its
/// inputs. Dependencies ran in earlier waves, so produced inputs exist.
fn compute_fingerprint(ctx: &ExecContext, id: &StepId, def: &StepDef) -> Result<ObjectHash, ExecError> {
  let mut inputs = Vec::with_capacity(def.inputs.len());
  let mut hashes = Vec::with_capacity(def.inputs.len());
  for input in &def.inputs {
    let hash = hash_file(&ctx.root.join(input)).map_err(|e| ExecError::Io {
      step: id.clone(),
      message: e.to_string(),
    })?;
    hashes.push((input.to_string_lossy().into_owned(), hash));
  }
  hashes.sort_by(|a, b| a.0.cmp(&b.0));
  for (name, hash) in &hashes {
    inputs.push((name.clone(), hash));
  }
  Ok(Fingerprint { def: id, inputs }.compute_hash()?)
}

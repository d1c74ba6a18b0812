//! Step executors.
//!
//! The scheduler decides *which* steps run; an executor decides *how*. The
//! local executor runs commands through the shell and writes files directly.
//! The recording executor exists for tests that assert on scheduling
//! decisions without shelling out.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::ExecError;
use crate::step::{StepDef, StepId, StepKind};

/// Execution-time environment shared by all steps of one invocation.
#[derive(Debug, Clone)]
pub struct ExecContext {
  /// Workspace root; step inputs and outputs are relative to it.
  pub root: PathBuf,
}

/// Runs one step to completion.
#[async_trait]
pub trait StepExecutor: Send + Sync {
  async fn execute(&self, ctx: &ExecContext, id: &StepId, def: &StepDef) -> Result<(), ExecError>;
}

/// Executes steps on the local machine.
pub struct LocalExecutor;

#[async_trait]
impl StepExecutor for LocalExecutor {
  async fn execute(&self, ctx: &ExecContext, id: &StepId, def: &StepDef) -> Result<(), ExecError> {
    create_output_dirs(ctx, id, def).await?;

    match &def.kind {
      StepKind::Command { cmd, env, cwd } => {
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(cmd);
        command.current_dir(match cwd {
          Some(dir) => ctx.root.join(dir),
          None => ctx.root.clone(),
        });
        if let Some(env) = env {
          command.envs(env);
        }

        debug!(step = %id, cmd = %cmd, "running command");
        let output = command.output().await.map_err(|e| ExecError::Io {
          step: id.clone(),
          message: e.to_string(),
        })?;
        if !output.status.success() {
          return Err(ExecError::StepFailed {
            step: id.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
          });
        }
        Ok(())
      }

      StepKind::WriteFile { contents, executable } => {
        let path = ctx.root.join(&def.outputs[0]);
        tokio::fs::write(&path, contents).await.map_err(|e| ExecError::Io {
          step: id.clone(),
          message: e.to_string(),
        })?;
        #[cfg(unix)]
        if *executable {
          use std::os::unix::fs::PermissionsExt;
          tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| ExecError::Io {
              step: id.clone(),
              message: e.to_string(),
            })?;
        }
        Ok(())
      }
    }
  }
}

async fn create_output_dirs(ctx: &ExecContext, id: &StepId, def: &StepDef) -> Result<(), ExecError> {
  for output in &def.outputs {
    if let Some(parent) = ctx.root.join(output).parent() {
      tokio::fs::create_dir_all(parent).await.map_err(|e| ExecError::Io {
        step: id.clone(),
        message: e.to_string(),
      })?;
    }
  }
  Ok(())
}

/// Records which steps were asked to run and touches their outputs, so
/// tests can assert on scheduling decisions alone.
#[derive(Default)]
pub struct RecordingExecutor {
  executed: Mutex<Vec<StepId>>,
  fail: HashSet<StepId>,
}

impl RecordingExecutor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fail the given step instead of executing it.
  pub fn failing(ids: impl IntoIterator<Item = StepId>) -> Self {
    Self {
      executed: Mutex::new(Vec::new()),
      fail: ids.into_iter().collect(),
    }
  }

  /// Ids executed so far, in completion order.
  pub fn executed(&self) -> Vec<StepId> {
    self.executed.lock().expect("lock poisoned").clone()
  }
}

#[async_trait]
impl StepExecutor for RecordingExecutor {
  async fn execute(&self, ctx: &ExecContext, id: &StepId, def: &StepDef) -> Result<(), ExecError> {
    if self.fail.contains(id) {
      return Err(ExecError::StepFailed {
        step: id.clone(),
        code: Some(1),
        stderr: "injected failure".to_string(),
      });
    }
    create_output_dirs(ctx, id, def).await?;
    for output in &def.outputs {
      tokio::fs::write(ctx.root.join(output), id.to_string())
        .await
        .map_err(|e| ExecError::Io {
          step: id.clone(),
          message: e.to_string(),
        })?;
    }
    self.executed.lock().expect("lock poisoned").push(id.clone());
    Ok(())
  }
}

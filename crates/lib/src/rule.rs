//! Rule implementations and the rule registry.
//!
//! A rule is the typed half of a target: the loader records which rule a
//! target names, and during analysis the rule's implementation runs against
//! the target's attributes and its dependencies' providers, declaring steps
//! and returning providers of its own. Implementations are plain Rust trait
//! objects registered by name; module code only ever references rules by
//! their registered identifier.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::consts::OUT_DIR;
use crate::label::Label;
use crate::provider::{ProviderData, ProviderValue};
use crate::step::{StepDef, StepKind};
use crate::target::{AttrValue, TargetDef};
use crate::tset::{Order, TransitiveSet, TsetError};

/// Error raised by a rule implementation during analysis.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
  #[error("target {target}: required attribute '{attr}' is missing")]
  MissingAttr { target: Label, attr: String },

  #[error("target {target}: attribute '{attr}' must be {expected}")]
  BadAttr {
    target: Label,
    attr: String,
    expected: &'static str,
  },

  #[error("target {target}: dependency {dep} provides no '{provider}'")]
  MissingProvider {
    target: Label,
    dep: Label,
    provider: String,
  },

  #[error("target {target}: {source}")]
  Set {
    target: Label,
    #[source]
    source: TsetError,
  },
}

/// Analysis-time view of one target handed to a rule implementation.
///
/// Borrows the declaration and the dependency providers; collects the
/// providers and steps the implementation declares.
pub struct RuleCtx<'a> {
  target: &'a TargetDef,
  deps: &'a BTreeMap<Label, Arc<ProviderData>>,
  providers: ProviderData,
  steps: Vec<StepDef>,
}

impl<'a> RuleCtx<'a> {
  pub fn new(target: &'a TargetDef, deps: &'a BTreeMap<Label, Arc<ProviderData>>) -> Self {
    Self {
      target,
      deps,
      providers: ProviderData::new(),
      steps: Vec::new(),
    }
  }

  pub fn label(&self) -> &Label {
    &self.target.label
  }

  pub fn attr(&self, name: &str) -> Option<&AttrValue> {
    self.target.attr(name)
  }

  /// A required string attribute.
  pub fn string_attr(&self, name: &str) -> Result<&str, RuleError> {
    match self.attr(name) {
      Some(value) => value.as_str().ok_or_else(|| RuleError::BadAttr {
        target: self.label().clone(),
        attr: name.to_string(),
        expected: "a string",
      }),
      None => Err(RuleError::MissingAttr {
        target: self.label().clone(),
        attr: name.to_string(),
      }),
    }
  }

  /// An optional string attribute with a default.
  pub fn string_attr_or<'s>(&'s self, name: &str, default: &'s str) -> Result<&'s str, RuleError> {
    match self.attr(name) {
      Some(value) => value.as_str().ok_or_else(|| RuleError::BadAttr {
        target: self.label().clone(),
        attr: name.to_string(),
        expected: "a string",
      }),
      None => Ok(default),
    }
  }

  /// An optional boolean attribute, defaulting to false.
  pub fn bool_attr(&self, name: &str) -> Result<bool, RuleError> {
    match self.attr(name) {
      Some(AttrValue::Bool(b)) => Ok(*b),
      Some(_) => Err(RuleError::BadAttr {
        target: self.label().clone(),
        attr: name.to_string(),
        expected: "a boolean",
      }),
      None => Ok(false),
    }
  }

  /// An optional list attribute, defaulting to empty.
  pub fn list_attr(&self, name: &str) -> Result<&[AttrValue], RuleError> {
    match self.attr(name) {
      Some(value) => value.as_list().ok_or_else(|| RuleError::BadAttr {
        target: self.label().clone(),
        attr: name.to_string(),
        expected: "a list",
      }),
      None => Ok(&[]),
    }
  }

  /// Providers of a direct dependency. Analysis guarantees every declared
  /// dependency has an entry by the time the implementation runs.
  pub fn dep(&self, label: &Label) -> Option<&ProviderData> {
    self.deps.get(label).map(Arc::as_ref)
  }

  /// The named transitive set from a dependency's providers.
  pub fn dep_set(&self, label: &Label, provider: &str) -> Result<TransitiveSet<String>, RuleError> {
    self
      .dep(label)
      .and_then(|data| data.get_set(provider))
      .cloned()
      .ok_or_else(|| RuleError::MissingProvider {
        target: self.label().clone(),
        dep: label.clone(),
        provider: provider.to_string(),
      })
  }

  /// Workspace-relative path for an output of this target, under the
  /// output tree at `<out>/<package>/<file>`.
  pub fn output_path(&self, file: &str) -> PathBuf {
    let mut path = PathBuf::from(OUT_DIR);
    if !self.label().package().is_empty() {
      path.push(self.label().package());
    }
    path.push(file);
    path
  }

  /// Workspace-relative path of a source file in this target's package.
  pub fn source_path(&self, file: &str) -> PathBuf {
    if self.label().package().is_empty() {
      PathBuf::from(file)
    } else {
      PathBuf::from(self.label().package()).join(file)
    }
  }

  pub fn provide(&mut self, name: impl Into<String>, value: ProviderValue) {
    self.providers.insert(name, value);
  }

  /// Declare a step owned by this target.
  pub fn declare_step(&mut self, mnemonic: impl Into<String>, inputs: Vec<PathBuf>, outputs: Vec<PathBuf>, kind: StepKind) {
    self.steps.push(StepDef {
      target: self.label().clone(),
      mnemonic: mnemonic.into(),
      inputs,
      outputs,
      kind,
    });
  }

  /// Consume the context into its declared providers and steps.
  pub fn finish(self) -> (ProviderData, Vec<StepDef>) {
    (self.providers, self.steps)
  }
}

/// A rule implementation. Pure with respect to its inputs: the same target
/// attributes and dependency providers must yield the same declarations.
pub trait RuleImpl: Send + Sync {
  fn analyze(&self, ctx: &mut RuleCtx<'_>) -> Result<(), RuleError>;
}

/// Named rule implementations available to an invocation.
#[derive(Default)]
pub struct RuleRegistry {
  rules: BTreeMap<String, Arc<dyn RuleImpl>>,
}

impl RuleRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, name: impl Into<String>, rule: impl RuleImpl + 'static) {
    self.rules.insert(name.into(), Arc::new(rule));
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn RuleImpl>> {
    self.rules.get(name).cloned()
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.rules.keys().map(String::as_str)
  }

  /// Register the builtin rule set.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    registry.register("write_file", WriteFileRule);
    registry.register("genrule", GenruleRule);
    registry.register("filegroup", FilegroupRule);
    registry
  }
}

/// Collect file paths contributed by a `srcs`-style attribute: plain strings
/// are package-relative source files, labels pull the dependency's `files`
/// set.
fn collect_srcs(ctx: &RuleCtx<'_>, attr: &str) -> Result<(Vec<PathBuf>, Vec<TransitiveSet<String>>), RuleError> {
  let mut files = Vec::new();
  let mut sets = Vec::new();
  for item in ctx.list_attr(attr)? {
    match item {
      AttrValue::String(s) => files.push(ctx.source_path(s)),
      AttrValue::Label(dep) => {
        let set = ctx.dep_set(dep, "files")?;
        for path in set.materialize() {
          files.push(PathBuf::from(path));
        }
        sets.push(set);
      }
      _ => {
        return Err(RuleError::BadAttr {
          target: ctx.label().clone(),
          attr: attr.to_string(),
          expected: "a list of strings or labels",
        });
      }
    }
  }
  Ok((files, sets))
}

fn files_provider(ctx: &RuleCtx<'_>, own: Vec<PathBuf>, children: Vec<TransitiveSet<String>>) -> Result<ProviderValue, RuleError> {
  let direct: Vec<String> = own.iter().map(|p| p.to_string_lossy().into_owned()).collect();
  let set = TransitiveSet::with_children(Order::Preorder, direct, children).map_err(|source| RuleError::Set {
    target: ctx.label().clone(),
    source,
  })?;
  Ok(ProviderValue::Set(set))
}

/// `write_file { name, contents, out?, executable? }` — materialize a fixed
/// string as a file.
struct WriteFileRule;

impl RuleImpl for WriteFileRule {
  fn analyze(&self, ctx: &mut RuleCtx<'_>) -> Result<(), RuleError> {
    let contents = ctx.string_attr("contents")?.to_string();
    let default_out = ctx.label().name().to_string();
    let out = ctx.string_attr_or("out", &default_out)?.to_string();
    let executable = ctx.bool_attr("executable")?;

    let output = ctx.output_path(&out);
    ctx.declare_step("WriteFile", Vec::new(), vec![output.clone()], StepKind::WriteFile { contents, executable });

    let files = files_provider(ctx, vec![output], Vec::new())?;
    ctx.provide("files", files);
    Ok(())
  }
}

/// `genrule { name, cmd, outs, srcs? }` — run a shell command producing the
/// declared outputs from the declared sources.
struct GenruleRule;

impl RuleImpl for GenruleRule {
  fn analyze(&self, ctx: &mut RuleCtx<'_>) -> Result<(), RuleError> {
    let cmd = ctx.string_attr("cmd")?.to_string();

    let mut outputs = Vec::new();
    for item in ctx.list_attr("outs")? {
      let Some(name) = item.as_str() else {
        return Err(RuleError::BadAttr {
          target: ctx.label().clone(),
          attr: "outs".to_string(),
          expected: "a list of strings",
        });
      };
      outputs.push(ctx.output_path(name));
    }
    if outputs.is_empty() {
      return Err(RuleError::MissingAttr {
        target: ctx.label().clone(),
        attr: "outs".to_string(),
      });
    }

    let (inputs, dep_sets) = collect_srcs(ctx, "srcs")?;

    // The command sees its inputs and outputs as space-separated env vars.
    let mut env = BTreeMap::new();
    env.insert(
      "SRCS".to_string(),
      inputs.iter().map(|p| p.to_string_lossy().into_owned()).collect::<Vec<_>>().join(" "),
    );
    env.insert(
      "OUTS".to_string(),
      outputs.iter().map(|p| p.to_string_lossy().into_owned()).collect::<Vec<_>>().join(" "),
    );

    ctx.declare_step(
      "Genrule",
      inputs,
      outputs.clone(),
      StepKind::Command {
        cmd,
        env: Some(env),
        cwd: None,
      },
    );

    let files = files_provider(ctx, outputs, dep_sets)?;
    ctx.provide("files", files);
    Ok(())
  }
}

/// `filegroup { name, srcs }` — aggregate files without doing any work.
/// Its `files` set unions the dependency sets structurally, so large
/// aggregates stay cheap no matter how often they are re-exported.
struct FilegroupRule;

impl RuleImpl for FilegroupRule {
  fn analyze(&self, ctx: &mut RuleCtx<'_>) -> Result<(), RuleError> {
    let mut own = Vec::new();
    let mut sets = Vec::new();
    for item in ctx.list_attr("srcs")? {
      match item {
        AttrValue::String(s) => own.push(ctx.source_path(s)),
        AttrValue::Label(dep) => sets.push(ctx.dep_set(dep, "files")?),
        _ => {
          return Err(RuleError::BadAttr {
            target: ctx.label().clone(),
            attr: "srcs".to_string(),
            expected: "a list of strings or labels",
          });
        }
      }
    }

    let files = files_provider(ctx, own, sets)?;
    ctx.provide("files", files);
    Ok(())
  }
}

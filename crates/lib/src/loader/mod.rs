//! The module loader and cache.
//!
//! Extension modules are Lua files identified by label (`//pkg:file.lua`).
//! Each module evaluates in its own environment table (falling back to the
//! Lua globals through a metatable), with two engine globals injected:
//! `load` for importing symbols from other modules and `target` for
//! declaring targets. A module evaluates at most once per invocation; the
//! result is cached by label, and a module reached again while still on the
//! current resolution chain is an import cycle, reported with the chain and
//! committed for neither participant.
//!
//! Evaluation is deliberately single-threaded: module bodies are
//! side-effect-free by contract, so memoized sequential evaluation is
//! observationally equivalent to any concurrent schedule, and it keeps the
//! whole loader on one Lua runtime.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

use mlua::prelude::*;
use tracing::debug;

use crate::consts::{ENV_BUILTINS, PRIVATE_PREFIX};
use crate::label::{Label, LabelError};
use crate::lua::globals::{DeclState, create_target_fn};
use crate::lua::runtime::create_runtime;
use crate::target::TargetDef;

/// Errors from module resolution and evaluation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
  /// The import graph contains a cycle; the chain starts and ends at the
  /// module that closed it.
  #[error("import cycle: {}", chain_display(.chain))]
  Cycle { chain: Vec<Label> },

  #[error("label {label} does not name a module file")]
  NotAModule { label: Label },

  #[error("module {label} not found at {path}")]
  ModuleNotFound { label: Label, path: String },

  #[error("module {module} does not export '{symbol}'")]
  SymbolNotFound { module: Label, symbol: String },

  #[error("symbol '{symbol}' of module {module} is private and cannot be imported")]
  PrivateSymbol { module: Label, symbol: String },

  #[error("module {module}: load() must come before any target declaration")]
  LoadAfterDeclaration { module: Label },

  #[error("invalid label: {0}")]
  Label(#[from] LabelError),

  #[error("module {module}: {message}")]
  Lua { module: Label, message: String },

  #[error("failed to create Lua runtime: {message}")]
  Runtime { message: String },
}

fn chain_display(chain: &[Label]) -> String {
  chain.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(" -> ")
}

/// An evaluated module: its label and exported symbol table.
///
/// Exports are every name the module body assigned at top level, engine
/// builtins excluded. Values stay as Lua values so macros (functions) can
/// be imported and called by other modules.
#[derive(Debug)]
pub struct Module {
  pub label: Label,
  exports: BTreeMap<String, LuaValue>,
}

impl Module {
  pub fn export(&self, name: &str) -> Option<&LuaValue> {
    self.exports.get(name)
  }

  pub fn export_names(&self) -> impl Iterator<Item = &str> {
    self.exports.keys().map(String::as_str)
  }
}

struct LoaderState {
  root: PathBuf,
  modules: RefCell<HashMap<Label, Rc<Module>>>,
  chain: Rc<RefCell<Vec<Label>>>,
  targets: Rc<RefCell<BTreeMap<Label, TargetDef>>>,
  frozen: Rc<RefCell<HashSet<Label>>>,
  eval_count: RefCell<HashMap<Label, usize>>,
  edges: RefCell<Vec<(Label, Label)>>,
}

impl LoaderState {
  fn decl_state(&self) -> DeclState {
    DeclState {
      chain: self.chain.clone(),
      targets: self.targets.clone(),
      frozen: self.frozen.clone(),
    }
  }
}

/// Resolves, evaluates, and caches extension modules for one invocation.
pub struct ModuleLoader {
  lua: Lua,
  state: Rc<LoaderState>,
}

impl ModuleLoader {
  pub fn new(root: impl Into<PathBuf>) -> Result<Self, LoadError> {
    let lua = create_runtime().map_err(|e| LoadError::Runtime { message: e.to_string() })?;
    Ok(Self {
      lua,
      state: Rc::new(LoaderState {
        root: root.into(),
        modules: RefCell::new(HashMap::new()),
        chain: Rc::new(RefCell::new(Vec::new())),
        targets: Rc::new(RefCell::new(BTreeMap::new())),
        frozen: Rc::new(RefCell::new(HashSet::new())),
        eval_count: RefCell::new(HashMap::new()),
        edges: RefCell::new(Vec::new()),
      }),
    })
  }

  /// Load a module, evaluating it if this invocation has not yet done so.
  pub fn load(&self, label: &Label) -> Result<Rc<Module>, LoadError> {
    load_module(&self.lua, &self.state, label)
  }

  /// Every target declared so far, in label order.
  pub fn targets(&self) -> Vec<TargetDef> {
    self.state.targets.borrow().values().cloned().collect()
  }

  /// How many times a module's body has been evaluated. Stays at 1 for any
  /// module however many import paths reach it.
  pub fn eval_count(&self, label: &Label) -> usize {
    self.state.eval_count.borrow().get(label).copied().unwrap_or(0)
  }

  /// Whether a module has a committed cache entry.
  pub fn is_cached(&self, label: &Label) -> bool {
    self.state.modules.borrow().contains_key(label)
  }

  /// Import edges observed so far, importer first.
  pub fn import_edges(&self) -> Vec<(Label, Label)> {
    self.state.edges.borrow().clone()
  }
}

fn load_module(lua: &Lua, state: &Rc<LoaderState>, label: &Label) -> Result<Rc<Module>, LoadError> {
  if !label.is_module() {
    return Err(LoadError::NotAModule { label: label.clone() });
  }

  if let Some(module) = state.modules.borrow().get(label) {
    return Ok(module.clone());
  }

  {
    let chain = state.chain.borrow();
    if let Some(start) = chain.iter().position(|l| l == label) {
      let mut cycle: Vec<Label> = chain[start..].to_vec();
      cycle.push(label.clone());
      return Err(LoadError::Cycle { chain: cycle });
    }
  }

  let path = label.to_path(&state.root);
  if !path.is_file() {
    return Err(LoadError::ModuleNotFound {
      label: label.clone(),
      path: path.display().to_string(),
    });
  }
  let content = std::fs::read_to_string(&path).map_err(|e| LoadError::Lua {
    module: label.clone(),
    message: e.to_string(),
  })?;

  state.chain.borrow_mut().push(label.clone());
  *state.eval_count.borrow_mut().entry(label.clone()).or_insert(0) += 1;
  debug!(module = %label, "evaluating module");

  let result = evaluate_module(lua, state, label, &path, &content);
  state.chain.borrow_mut().pop();

  let module = result?;
  state.modules.borrow_mut().insert(label.clone(), module.clone());
  Ok(module)
}

fn evaluate_module(
  lua: &Lua,
  state: &Rc<LoaderState>,
  label: &Label,
  path: &std::path::Path,
  content: &str,
) -> Result<Rc<Module>, LoadError> {
  let env = build_env(lua, state, label).map_err(|e| LoadError::Lua {
    module: label.clone(),
    message: e.to_string(),
  })?;

  lua
    .load(content)
    .set_name(format!("@{}", path.display()))
    .set_environment(env.clone())
    .exec()
    .map_err(|e| recover_load_error(label, e))?;

  let mut exports = BTreeMap::new();
  for pair in env.pairs::<String, LuaValue>() {
    let (name, value) = pair.map_err(|e| LoadError::Lua {
      module: label.clone(),
      message: e.to_string(),
    })?;
    if ENV_BUILTINS.contains(&name.as_str()) {
      continue;
    }
    exports.insert(name, value);
  }

  Ok(Rc::new(Module {
    label: label.clone(),
    exports,
  }))
}

/// Build a module's environment: a fresh table falling back to the Lua
/// globals, with `load` and `target` bound to this module.
fn build_env(lua: &Lua, state: &Rc<LoaderState>, label: &Label) -> LuaResult<LuaTable> {
  let env = lua.create_table()?;
  let mt = lua.create_table()?;
  mt.set("__index", lua.globals())?;
  env.set_metatable(Some(mt))?;

  env.set("target", create_target_fn(lua, state.decl_state())?)?;
  env.set("load", create_load_fn(lua, state, label, &env)?)?;

  Ok(env)
}

/// Create the `load("<label>", "sym", { alias = "sym" })` function for one
/// module. Plain string arguments import symbols under their own name; a
/// table argument imports under aliases.
fn create_load_fn(lua: &Lua, state: &Rc<LoaderState>, importer: &Label, env: &LuaTable) -> LuaResult<LuaFunction> {
  let state = state.clone();
  let importer = importer.clone();
  let env = env.clone();

  lua.create_function(move |lua, (path, rest): (String, LuaMultiValue)| {
    if state.frozen.borrow().contains(&importer) {
      return Err(LuaError::external(LoadError::LoadAfterDeclaration {
        module: importer.clone(),
      }));
    }

    let imported_label =
      Label::parse_in_package(&path, importer.package()).map_err(|e| LuaError::external(LoadError::Label(e)))?;
    let module = load_module(lua, &state, &imported_label).map_err(LuaError::external)?;
    state.edges.borrow_mut().push((importer.clone(), imported_label));

    for arg in rest {
      match arg {
        LuaValue::String(symbol) => {
          let symbol = symbol.to_str()?.to_string();
          let value = lookup_export(&module, &symbol).map_err(LuaError::external)?;
          env.set(symbol, value)?;
        }
        LuaValue::Table(aliases) => {
          for pair in aliases.pairs::<String, String>() {
            let (alias, symbol) = pair?;
            let value = lookup_export(&module, &symbol).map_err(LuaError::external)?;
            env.set(alias, value)?;
          }
        }
        other => {
          return Err(LuaError::external(format!(
            "load() arguments must be symbol names or an alias table, got '{}'",
            other.type_name()
          )));
        }
      }
    }
    Ok(())
  })
}

fn lookup_export(module: &Module, symbol: &str) -> Result<LuaValue, LoadError> {
  if symbol.starts_with(PRIVATE_PREFIX) {
    return Err(LoadError::PrivateSymbol {
      module: module.label.clone(),
      symbol: symbol.to_string(),
    });
  }
  module.export(symbol).cloned().ok_or_else(|| LoadError::SymbolNotFound {
    module: module.label.clone(),
    symbol: symbol.to_string(),
  })
}

/// Pull a typed `LoadError` back out of a Lua error if one caused it;
/// otherwise wrap the Lua error with the failing module.
fn recover_load_error(module: &Label, err: LuaError) -> LoadError {
  fn find(err: &LuaError) -> Option<LoadError> {
    match err {
      LuaError::CallbackError { cause, .. } => find(cause),
      LuaError::WithContext { cause, .. } => find(cause),
      LuaError::ExternalError(source) => source.downcast_ref::<LoadError>().cloned(),
      _ => None,
    }
  }
  find(&err).unwrap_or_else(|| LoadError::Lua {
    module: module.clone(),
    message: err.to_string(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn workspace(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (path, content) in files {
      let full = dir.path().join(path);
      fs::create_dir_all(full.parent().unwrap()).unwrap();
      fs::write(full, content).unwrap();
    }
    dir
  }

  fn label(s: &str) -> Label {
    s.parse().unwrap()
  }

  #[test]
  fn evaluates_module_and_collects_exports() {
    let ws = workspace(&[("lib/defs.lua", "greeting = 'hello'\n_secret = 'x'\n")]);
    let loader = ModuleLoader::new(ws.path()).unwrap();

    let module = loader.load(&label("//lib:defs.lua")).unwrap();
    assert_eq!(
      module.export("greeting").and_then(|v| v.as_string()).map(|s| s.to_string_lossy()),
      Some("hello".to_string())
    );
    // Private symbols are exported locally; the import path rejects them.
    assert!(module.export("_secret").is_some());
    assert!(module.export("load").is_none());
  }

  #[test]
  fn imports_bind_symbols_and_aliases() {
    let ws = workspace(&[
      ("lib/defs.lua", "value = 41\n"),
      (
        "app/BUILD.lua",
        "load('//lib:defs.lua', 'value', { renamed = 'value' })\nresult = value + 1\nother = renamed\n",
      ),
    ]);
    let loader = ModuleLoader::new(ws.path()).unwrap();

    let module = loader.load(&label("//app:BUILD.lua")).unwrap();
    assert_eq!(module.export("result").and_then(|v| v.as_i64()), Some(42));
    assert_eq!(module.export("other").and_then(|v| v.as_i64()), Some(41));
    assert_eq!(
      loader.import_edges(),
      vec![(label("//app:BUILD.lua"), label("//lib:defs.lua"))]
    );
  }

  #[test]
  fn module_reached_through_three_paths_evaluates_once() {
    let ws = workspace(&[
      ("base/core.lua", "n = 1\n"),
      ("a/a.lua", "load('//base:core.lua', 'n')\nan = n\n"),
      ("b/b.lua", "load('//base:core.lua', 'n')\nbn = n\n"),
      (
        "top/top.lua",
        "load('//a:a.lua', 'an')\nload('//b:b.lua', 'bn')\nload('//base:core.lua', 'n')\ntotal = an + bn + n\n",
      ),
    ]);
    let loader = ModuleLoader::new(ws.path()).unwrap();

    let module = loader.load(&label("//top:top.lua")).unwrap();
    assert_eq!(module.export("total").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(loader.eval_count(&label("//base:core.lua")), 1);
  }

  #[test]
  fn repeated_load_is_idempotent() {
    let ws = workspace(&[("lib/defs.lua", "value = 1\n")]);
    let loader = ModuleLoader::new(ws.path()).unwrap();

    let first = loader.load(&label("//lib:defs.lua")).unwrap();
    let second = loader.load(&label("//lib:defs.lua")).unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(loader.eval_count(&label("//lib:defs.lua")), 1);
  }

  #[test]
  fn import_cycle_names_both_modules_and_commits_nothing() {
    let ws = workspace(&[
      ("a/a.lua", "load('//b:b.lua', 'bv')\nav = 1\n"),
      ("b/b.lua", "load('//a:a.lua', 'av')\nbv = 1\n"),
    ]);
    let loader = ModuleLoader::new(ws.path()).unwrap();

    let err = loader.load(&label("//a:a.lua")).unwrap_err();
    let LoadError::Cycle { chain } = err else {
      panic!("expected cycle error, got {err:?}");
    };
    assert_eq!(chain, vec![label("//a:a.lua"), label("//b:b.lua"), label("//a:a.lua")]);
    assert!(!loader.is_cached(&label("//a:a.lua")));
    assert!(!loader.is_cached(&label("//b:b.lua")));
  }

  #[test]
  fn private_symbols_cannot_be_imported() {
    let ws = workspace(&[
      ("lib/defs.lua", "_internal = 1\n"),
      ("app/BUILD.lua", "load('//lib:defs.lua', '_internal')\n"),
    ]);
    let loader = ModuleLoader::new(ws.path()).unwrap();

    let err = loader.load(&label("//app:BUILD.lua")).unwrap_err();
    assert!(matches!(err, LoadError::PrivateSymbol { symbol, .. } if symbol == "_internal"));
  }

  #[test]
  fn unknown_symbol_is_reported() {
    let ws = workspace(&[
      ("lib/defs.lua", "value = 1\n"),
      ("app/BUILD.lua", "load('//lib:defs.lua', 'missing')\n"),
    ]);
    let loader = ModuleLoader::new(ws.path()).unwrap();

    let err = loader.load(&label("//app:BUILD.lua")).unwrap_err();
    assert!(matches!(err, LoadError::SymbolNotFound { symbol, .. } if symbol == "missing"));
  }

  #[test]
  fn unknown_module_is_reported() {
    let ws = workspace(&[]);
    let loader = ModuleLoader::new(ws.path()).unwrap();
    let err = loader.load(&label("//nope:defs.lua")).unwrap_err();
    assert!(matches!(err, LoadError::ModuleNotFound { .. }));
  }

  #[test]
  fn load_after_declaration_is_rejected() {
    let ws = workspace(&[
      ("lib/defs.lua", "value = 1\n"),
      (
        "app/BUILD.lua",
        "target { name = 'tool', rule = 'noop' }\nload('//lib:defs.lua', 'value')\n",
      ),
    ]);
    let loader = ModuleLoader::new(ws.path()).unwrap();

    let err = loader.load(&label("//app:BUILD.lua")).unwrap_err();
    assert!(matches!(err, LoadError::LoadAfterDeclaration { .. }));
  }

  #[test]
  fn targets_declared_during_loading_are_collected() {
    let ws = workspace(&[(
      "app/BUILD.lua",
      r#"
        target { name = "hello", rule = "write_file", contents = "hi" }
        target { name = "group", rule = "filegroup", srcs = { ":hello" } }
      "#,
    )]);
    let loader = ModuleLoader::new(ws.path()).unwrap();
    loader.load(&label("//app:BUILD.lua")).unwrap();

    let targets = loader.targets();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].label, label("//app:group"));
    assert_eq!(targets[0].declared_by, label("//app:BUILD.lua"));
    assert_eq!(targets[1].label, label("//app:hello"));
  }

  #[test]
  fn imported_macro_declares_targets_in_the_calling_package() {
    let ws = workspace(&[
      (
        "rules/macros.lua",
        r#"
          function twin_files(base)
            target { name = base .. "_x", rule = "write_file", contents = "x" }
            target { name = base .. "_y", rule = "write_file", contents = "y" }
          end
        "#,
      ),
      (
        "app/BUILD.lua",
        "load('//rules:macros.lua', 'twin_files')\ntwin_files('gen')\n",
      ),
    ]);
    let loader = ModuleLoader::new(ws.path()).unwrap();
    loader.load(&label("//app:BUILD.lua")).unwrap();

    let targets = loader.targets();
    assert_eq!(targets.len(), 2);
    // The declaring module is the one being evaluated when target{} runs,
    // so the macro's targets land in the caller's package.
    assert!(targets.iter().all(|t| t.label.package() == "app"));
    assert!(
      targets
        .iter()
        .all(|t| t.declared_by == label("//app:BUILD.lua"))
    );
  }
}

//! The `target{}` declaration global.
//!
//! `target{}` is the single way module code adds a target declaration.
//! Declarations accumulate in loader-owned shared state. The declaring
//! module is always the module currently being evaluated (the top of the
//! loader's resolution chain), not the module that defined the calling
//! function: a macro imported from another module declares targets in its
//! caller's package, which is what macro authors expect. A module's first
//! declaration freezes its imports, which is how "imports before anything
//! else" is enforced without a separate parse pass.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use mlua::prelude::*;

use crate::label::Label;
use crate::lua::convert::lua_to_attr;
use crate::target::TargetDef;

/// Declaration state shared between the loader and the `target` global.
#[derive(Clone)]
pub struct DeclState {
  /// Modules currently being evaluated, outermost first.
  pub chain: Rc<RefCell<Vec<Label>>>,

  /// Declared targets, invocation-wide.
  pub targets: Rc<RefCell<BTreeMap<Label, TargetDef>>>,

  /// Modules that have declared something; their imports are frozen.
  pub frozen: Rc<RefCell<HashSet<Label>>>,
}

/// Create the `target` function.
pub fn create_target_fn(lua: &Lua, decl: DeclState) -> LuaResult<LuaFunction> {
  lua.create_function(move |_, spec: LuaTable| {
    let declared_by = decl
      .chain
      .borrow()
      .last()
      .cloned()
      .ok_or_else(|| LuaError::external("target{} called outside module evaluation"))?;
    decl.frozen.borrow_mut().insert(declared_by.clone());

    let name: String = spec
      .get::<Option<String>>("name")?
      .ok_or_else(|| LuaError::external("target{} requires a 'name' string"))?;
    let rule: String = spec
      .get::<Option<String>>("rule")?
      .ok_or_else(|| LuaError::external(format!("target '{}' requires a 'rule' string", name)))?;

    let label = Label::new(declared_by.package(), name);

    let mut attrs = BTreeMap::new();
    for pair in spec.pairs::<LuaValue, LuaValue>() {
      let (key, value) = pair?;
      let LuaValue::String(key) = key else {
        return Err(LuaError::external(format!(
          "target '{}': attribute names must be strings",
          label
        )));
      };
      let key = key.to_str()?.to_string();
      if key == "name" || key == "rule" {
        continue;
      }
      let attr = lua_to_attr(&value, declared_by.package())
        .map_err(|e| LuaError::external(format!("target '{}', attribute '{}': {}", label, key, e)))?;
      attrs.insert(key, attr);
    }

    let mut targets = decl.targets.borrow_mut();
    if let Some(existing) = targets.get(&label) {
      return Err(LuaError::external(format!(
        "target '{}' is already declared by {}",
        label, existing.declared_by
      )));
    }
    targets.insert(
      label.clone(),
      TargetDef {
        label,
        rule,
        attrs,
        declared_by,
      },
    );
    Ok(())
  })
}

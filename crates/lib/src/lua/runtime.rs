//! Lua runtime creation.

use mlua::prelude::*;

/// Create the Lua runtime used to evaluate extension modules.
///
/// Modules run in per-module environments built by the loader; the runtime
/// itself carries only the standard library. `require` and friends still
/// resolve against the process working directory, but module-to-module
/// imports go through the injected `load` global instead.
pub fn create_runtime() -> LuaResult<Lua> {
  let lua = Lua::new();
  Ok(lua)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn runtime_evaluates_lua() -> LuaResult<()> {
    let lua = create_runtime()?;
    let result: i64 = lua.load("return 1 + 2").eval()?;
    assert_eq!(result, 3);
    Ok(())
  }
}

//! Conversion from Lua values to attribute values.

use mlua::prelude::*;
use std::collections::BTreeMap;

use crate::label::Label;
use crate::target::AttrValue;

/// Convert a Lua attribute value into an `AttrValue`.
///
/// Strings starting with `//` or `:` are label references, resolved against
/// `package`; a malformed label string is an error rather than silently
/// staying a string. Tables with consecutive integer keys become lists,
/// string-keyed tables become dicts.
pub fn lua_to_attr(value: &LuaValue, package: &str) -> LuaResult<AttrValue> {
  match value {
    LuaValue::String(s) => {
      let s = s.to_str()?;
      if s.starts_with("//") || s.starts_with(':') {
        let label = Label::parse_in_package(&s, package)
          .map_err(|e| LuaError::external(format!("invalid label reference: {}", e)))?;
        Ok(AttrValue::Label(label))
      } else {
        Ok(AttrValue::String(s.to_string()))
      }
    }
    LuaValue::Integer(i) => Ok(AttrValue::Int(*i)),
    LuaValue::Number(n) => {
      if n.fract() == 0.0 {
        Ok(AttrValue::Int(*n as i64))
      } else {
        Err(LuaError::external(format!(
          "attribute value {} is not an integer; fractional numbers are not supported",
          n
        )))
      }
    }
    LuaValue::Boolean(b) => Ok(AttrValue::Bool(*b)),
    LuaValue::Table(table) => lua_table_to_attr(table, package),
    other => Err(LuaError::external(format!(
      "unsupported attribute value of type '{}'",
      other.type_name()
    ))),
  }
}

fn lua_table_to_attr(table: &LuaTable, package: &str) -> LuaResult<AttrValue> {
  let len = table.raw_len();
  if len > 0 {
    let mut items = Vec::with_capacity(len);
    for i in 1..=len {
      let item: LuaValue = table.raw_get(i)?;
      items.push(lua_to_attr(&item, package)?);
    }
    return Ok(AttrValue::List(items));
  }

  let mut map = BTreeMap::new();
  for pair in table.pairs::<LuaValue, LuaValue>() {
    let (key, value) = pair?;
    let LuaValue::String(key) = key else {
      return Err(LuaError::external(format!(
        "attribute table keys must be strings, got '{}'",
        key.type_name()
      )));
    };
    map.insert(key.to_str()?.to_string(), lua_to_attr(&value, package)?);
  }
  if map.is_empty() {
    // An empty table is ambiguous; treat it as an empty list, the common case.
    return Ok(AttrValue::List(Vec::new()));
  }
  Ok(AttrValue::Dict(map))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn convert(code: &str) -> LuaResult<AttrValue> {
    let lua = Lua::new();
    let value: LuaValue = lua.load(code).eval()?;
    lua_to_attr(&value, "app")
  }

  #[test]
  fn scalars_convert() {
    assert_eq!(convert("return 'hello'").unwrap(), AttrValue::String("hello".to_string()));
    assert_eq!(convert("return 42").unwrap(), AttrValue::Int(42));
    assert_eq!(convert("return true").unwrap(), AttrValue::Bool(true));
  }

  #[test]
  fn label_strings_become_labels() {
    assert_eq!(
      convert("return '//lib:core'").unwrap(),
      AttrValue::Label("//lib:core".parse().unwrap())
    );
    // Relative labels resolve against the declaring package.
    assert_eq!(
      convert("return ':sibling'").unwrap(),
      AttrValue::Label(Label::new("app", "sibling"))
    );
  }

  #[test]
  fn malformed_label_is_an_error() {
    assert!(convert("return '//bad label:x'").is_err());
  }

  #[test]
  fn sequences_become_lists() {
    let value = convert("return { 'a', ':b', 3 }").unwrap();
    assert_eq!(
      value,
      AttrValue::List(vec![
        AttrValue::String("a".to_string()),
        AttrValue::Label(Label::new("app", "b")),
        AttrValue::Int(3),
      ])
    );
  }

  #[test]
  fn string_keyed_tables_become_dicts() {
    let value = convert("return { mode = 'fast', level = 2 }").unwrap();
    let AttrValue::Dict(map) = value else {
      panic!("expected dict");
    };
    assert_eq!(map["mode"], AttrValue::String("fast".to_string()));
    assert_eq!(map["level"], AttrValue::Int(2));
  }

  #[test]
  fn functions_are_rejected() {
    assert!(convert("return function() end").is_err());
  }
}

//! Helpers that paper over differences between Lua runtime versions.

use mlua::{Function, Lua, Table, Value};

/// Registry slot holding the runtime's own `tostring`, captured before scripts run.
const TOSTRING_KEY: &str = "mapstate.tostring";

/// Remember the pristine `tostring` so scripts overriding the global cannot
/// change how the host stringifies values.
pub fn install(lua: &Lua) -> mlua::Result<()> {
    let tostring: Function = lua.globals().get("tostring")?;
    lua.set_named_registry_value(TOSTRING_KEY, tostring)
}

/// Convert any value to a string the way `luaL_tolstring` does.
///
/// Honours `__tostring` (which must return a string) and `__name`.
pub fn tostring(lua: &Lua, value: &Value) -> mlua::Result<String> {
    if let Value::String(s) = value {
        return Ok(s.to_str()?.to_string());
    }

    let tostring = match lua.named_registry_value::<Function>(TOSTRING_KEY) {
        Ok(f) => f,
        Err(_) => lua.globals().get::<Function>("tostring")?,
    };
    match tostring.call::<Value>(value.clone())? {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        _ => Err(mlua::Error::RuntimeError(
            "'__tostring' must return a string".to_string(),
        )),
    }
}

/// Fetch `parent[name]` as a table, creating and storing an empty one if it
/// is missing or not a table.
///
/// Returns the table and whether it already existed.
pub fn subtable(lua: &Lua, parent: &Table, name: &str) -> mlua::Result<(Table, bool)> {
    match parent.get::<Value>(name)? {
        Value::Table(table) => Ok((table, true)),
        _ => {
            let table = lua.create_table()?;
            parent.set(name, table.clone())?;
            Ok((table, false))
        }
    }
}

//! Native functions exposed to every Lua state.
//!
//! Installs `RegisterStateEvent`, `NotifyStateEvent`, the state introspection
//! globals and a `print` routed through `tracing`.

use std::sync::Arc;

use mlua::{Lua, Result as LuaResult, Value, Variadic};
use tracing::info;

use super::compat;
use super::engine::StateContext;

/// Register the state API with the Lua environment.
pub(crate) fn register(lua: &Lua, context: Arc<StateContext>) -> LuaResult<()> {
    register_event_functions(lua, &context)?;
    register_state_info(lua, &context)?;
    register_print(lua, &context)?;
    Ok(())
}

/// `RegisterStateEvent(mapId, eventName, handler)` and
/// `NotifyStateEvent(mapId, eventName, data)`.
fn register_event_functions(lua: &Lua, context: &Arc<StateContext>) -> LuaResult<()> {
    let globals = lua.globals();

    let ctx = Arc::clone(context);
    let register_fn = lua.create_function(
        move |lua, (map_id, event_name, handler): (i64, String, Value)| {
            let map_id = check_map_id("RegisterStateEvent", map_id)?;
            let handler = match handler {
                Value::Function(handler) => handler,
                other => {
                    return Err(bad_argument(
                        "RegisterStateEvent",
                        3,
                        &format!("function expected, got {}", other.type_name()),
                    ))
                }
            };
            ctx.register_handler(lua, map_id, event_name, handler)
        },
    )?;
    globals.set("RegisterStateEvent", register_fn)?;

    let ctx = Arc::clone(context);
    let notify_fn = lua.create_function(
        move |_, (map_id, event_name, data): (i64, String, String)| {
            let map_id = check_map_id("NotifyStateEvent", map_id)?;
            ctx.bus.notify(map_id, &event_name, &data);
            Ok(())
        },
    )?;
    globals.set("NotifyStateEvent", notify_fn)?;

    Ok(())
}

/// `GetStateMapId()`, `GetStateInstanceId()` and `IsCompatibilityMode()`.
fn register_state_info(lua: &Lua, context: &Arc<StateContext>) -> LuaResult<()> {
    let globals = lua.globals();
    let key = context.key;

    globals.set(
        "GetStateMapId",
        lua.create_function(move |_, ()| Ok(key.map_id()))?,
    )?;
    globals.set(
        "GetStateInstanceId",
        lua.create_function(move |_, ()| Ok(key.instance_id()))?,
    )?;

    let compatibility_mode = context.compatibility_mode;
    globals.set(
        "IsCompatibilityMode",
        lua.create_function(move |_, ()| Ok(compatibility_mode))?,
    )?;

    Ok(())
}

/// Replace `print` so script output lands in the host log.
fn register_print(lua: &Lua, context: &Arc<StateContext>) -> LuaResult<()> {
    let key = context.key;
    let print_fn = lua.create_function(move |lua, args: Variadic<Value>| {
        let mut parts = Vec::with_capacity(args.len());
        for value in args.iter() {
            parts.push(compat::tostring(lua, value)?);
        }
        info!(target: "mapstate::lua", state = %key, "{}", parts.join("\t"));
        Ok(())
    })?;
    lua.globals().set("print", print_fn)
}

fn check_map_id(function: &str, map_id: i64) -> LuaResult<u32> {
    u32::try_from(map_id)
        .map_err(|_| bad_argument(function, 1, &format!("map id {} out of range", map_id)))
}

fn bad_argument(function: &str, position: usize, message: &str) -> mlua::Error {
    mlua::Error::RuntimeError(format!(
        "bad argument #{} to '{}' ({})",
        position, function, message
    ))
}

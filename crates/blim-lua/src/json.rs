//! `json` module preloaded into every runtime.
//!
//! ```lua
//! local json = require("json")
//! local text = json.encode({ bpm = 72, zones = { 1, 2 } })
//! local back = json.decode(text)
//! ```

use crate::barrier::guard_host_fn;
use crate::error::ScriptError;
use crate::types::{json_to_lua, lua_to_json};
use mlua::{Lua, Table, Value};

/// Builds the module table and registers it as global `json` and in
/// `package.loaded`.
pub fn install(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    module.set(
        "encode",
        guard_host_fn(lua, "json.encode", |_, value: Value| {
            let json = lua_to_json(&value)
                .map_err(|e| ScriptError::api(format!("json.encode() failed: {e}")))?;
            Ok(json.to_string())
        })?,
    )?;

    module.set(
        "decode",
        guard_host_fn(lua, "json.decode", |lua, text: mlua::String| {
            let parsed: serde_json::Value = serde_json::from_slice(&text.as_bytes())
                .map_err(|e| ScriptError::api(format!("json.decode() failed: {e}")))?;
            json_to_lua(lua, &parsed)
        })?,
    )?;

    lua.globals().set("json", module.clone())?;
    let loaded: Table = lua.globals().get::<Table>("package")?.get("loaded")?;
    loaded.set("json", module.clone())?;
    Ok(module)
}

//! Conversions between Lua values and JSON.

use mlua::{Lua, LuaSerdeExt, SerializeOptions, Table, Value};
use std::ffi::c_void;

/// Deepest table nesting [`lua_to_json`] follows.
pub const MAX_JSON_DEPTH: usize = 128;

/// Converts a Lua value to JSON.
///
/// Tables with a positive raw length become arrays; every other table becomes
/// an object whose keys are the table's string (or number) keys. A table that
/// contains itself, directly or through its children, is rejected; the same
/// table appearing twice side by side is not.
pub fn lua_to_json(value: &Value) -> Result<serde_json::Value, mlua::Error> {
    let mut ancestors = Vec::new();
    encode(value, &mut ancestors)
}

fn encode(
    value: &Value,
    ancestors: &mut Vec<*const c_void>,
) -> Result<serde_json::Value, mlua::Error> {
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Integer(i) => Ok(serde_json::Value::Number((*i).into())),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| mlua::Error::SerializeError(format!("cannot encode number {n}"))),
        Value::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        Value::Table(table) => {
            let ptr = table.to_pointer();
            if ancestors.contains(&ptr) {
                return Err(mlua::Error::SerializeError("recursive table".into()));
            }
            if ancestors.len() >= MAX_JSON_DEPTH {
                return Err(mlua::Error::SerializeError(format!(
                    "tables nested deeper than {MAX_JSON_DEPTH}"
                )));
            }
            ancestors.push(ptr);
            let encoded = encode_table(table, ancestors);
            ancestors.pop();
            encoded
        }
        other => Err(mlua::Error::SerializeError(format!(
            "cannot encode {}",
            other.type_name()
        ))),
    }
}

fn encode_table(
    table: &Table,
    ancestors: &mut Vec<*const c_void>,
) -> Result<serde_json::Value, mlua::Error> {
    let len = table.raw_len();
    if len > 0 {
        let mut arr = Vec::with_capacity(len);
        for i in 1..=len {
            let v: Value = table.raw_get(i)?;
            arr.push(encode(&v, ancestors)?);
        }
        return Ok(serde_json::Value::Array(arr));
    }
    let mut map = serde_json::Map::new();
    for pair in table.pairs::<Value, Value>() {
        let (k, v) = pair?;
        let key = match k {
            Value::String(s) => s.to_str()?.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(mlua::Error::SerializeError(format!(
                    "cannot encode {} key",
                    other.type_name()
                )))
            }
        };
        map.insert(key, encode(&v, ancestors)?);
    }
    Ok(serde_json::Value::Object(map))
}

/// Converts JSON to a Lua value. `null` becomes `nil`.
pub fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> Result<Value, mlua::Error> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    lua.to_value_with(value, options)
}

/// Uppercase hex rendering used for advertisement payloads.
pub fn hex_upper(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02X}");
        s
    })
}

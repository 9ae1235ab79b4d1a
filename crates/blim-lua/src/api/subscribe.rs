//! `blim.subscribe{...}` and `blim.unsubscribe(id)`.
//!
//! ```lua
//! local id = blim.subscribe{
//!   services = { { service = "180d", chars = { "2a37" } } },
//!   Mode = "Aggregated",     -- "EveryUpdate" (default) | "Batched" | "Aggregated"
//!   MaxRate = 100,           -- milliseconds, 0 = unlimited
//!   Callback = function(record) print(record.Seq) end,
//! }
//! blim.unsubscribe(id)
//! ```

use crate::barrier::{contain, guard_host_fn};
use crate::callback::CallbackTable;
use crate::dispatch::{StreamMode, SubscriptionConfig, SubscriptionDispatcher, SubscriptionId};
use crate::error::ScriptError;
use crate::suspend::{suspendable, Begun, HostOutcome, Request};
use blim_device::{Device, SubscribeOptions};
use mlua::{Function, Lua, Table, Value};
use std::sync::Arc;
use std::time::Duration;

fn parse_error(reason: impl std::fmt::Display) -> ScriptError {
    ScriptError::api(format!("Error parsing subscription config: {reason}"))
}

fn exec_error(reason: impl std::fmt::Display) -> String {
    format!("Error executing subscription: {reason}")
}

fn string_field(value: Value, what: &str) -> Result<String, ScriptError> {
    match value {
        Value::String(s) => Ok(s.to_string_lossy()),
        other => Err(parse_error(format!(
            "{what} must be a string, got {}",
            other.type_name()
        ))),
    }
}

/// Parses the script table into a config without a callback, plus the
/// callback function if one was given.
fn parse_config(table: &Table) -> Result<(SubscriptionConfig, Option<Function>), ScriptError> {
    let get = |key: &str| table.get::<Value>(key).map_err(parse_error);

    let mut selectors = Vec::new();
    match get("services")? {
        Value::Nil => {}
        Value::Table(services) => {
            for (idx, entry) in services.sequence_values::<Value>().enumerate() {
                let Value::Table(entry) = entry.map_err(parse_error)? else {
                    return Err(parse_error(format!("services[{}] must be a table", idx + 1)));
                };
                let service = string_field(entry.get("service").map_err(parse_error)?, "service")?;
                let chars = match entry.get::<Value>("chars").map_err(parse_error)? {
                    Value::Nil => Vec::new(),
                    Value::Table(chars) => chars
                        .sequence_values::<Value>()
                        .map(|c| string_field(c.map_err(parse_error)?, "chars entry"))
                        .collect::<Result<Vec<_>, _>>()?,
                    other => {
                        return Err(parse_error(format!(
                            "chars must be a table, got {}",
                            other.type_name()
                        )))
                    }
                };
                selectors.push(SubscribeOptions::new(&service, &chars));
            }
        }
        other => {
            return Err(parse_error(format!(
                "services must be a table, got {}",
                other.type_name()
            )))
        }
    }

    let mode = match get("Mode")? {
        Value::Nil => StreamMode::default(),
        value => StreamMode::parse(&string_field(value, "Mode")?),
    };

    let max_rate = match get("MaxRate")? {
        Value::Nil => Duration::ZERO,
        Value::Integer(ms) => Duration::from_millis(u64::try_from(ms).unwrap_or(0)),
        Value::Number(ms) if ms.is_finite() => Duration::from_millis(ms.max(0.0) as u64),
        other => {
            return Err(parse_error(format!(
                "MaxRate must be a number, got {}",
                other.type_name()
            )))
        }
    };

    let callback = match get("Callback")? {
        Value::Nil => None,
        Value::Function(f) => Some(f),
        other => {
            return Err(parse_error(format!(
                "Callback must be a function, got {}",
                other.type_name()
            )))
        }
    };

    Ok((
        SubscriptionConfig {
            selectors,
            mode,
            max_rate,
            callback: None,
        },
        callback,
    ))
}

pub(super) fn subscribe_fn(
    lua: &Lua,
    device: &Arc<dyn Device>,
    dispatcher: &Arc<SubscriptionDispatcher>,
) -> mlua::Result<Function> {
    let device = Arc::clone(device);
    let dispatcher = Arc::clone(dispatcher);
    suspendable(lua, "subscribe", move |lua, _defer, arg: Value| {
        let Value::Table(table) = arg else {
            return Err(ScriptError::api("subscribe() expects a lua table argument").into());
        };
        let (mut config, callback) = parse_config(&table)?;
        dispatcher.reap_orphans(lua);

        let connection = device
            .connection()
            .ok_or_else(|| ScriptError::runtime(exec_error("no connection available")))?;
        if let Some(func) = callback {
            config.callback = Some(CallbackTable::register(lua, func)?);
        }
        if let Err(e) = config.validate() {
            if let Some(callback) = config.callback {
                CallbackTable::release(lua, callback);
            }
            return Err(ScriptError::runtime(exec_error(e)).into());
        }

        let dispatcher = Arc::clone(&dispatcher);
        Ok(Begun::Suspend(Request::Host(Box::new(move || {
            let callback = config.callback;
            let subscribed = contain("subscribe", || Ok(dispatcher.subscribe(connection, config)));
            let message = match subscribed {
                Ok(Ok(id)) => return HostOutcome::Integer(id.0 as i64),
                Ok(Err(e)) => exec_error(e),
                Err(fault) => fault.message,
            };
            if let Some(callback) = callback {
                dispatcher.orphan(callback);
            }
            HostOutcome::Raised(message)
        }))))
    })
}

pub(super) fn unsubscribe_fn(
    lua: &Lua,
    dispatcher: &Arc<SubscriptionDispatcher>,
) -> mlua::Result<Function> {
    let dispatcher = Arc::clone(dispatcher);
    guard_host_fn(lua, "unsubscribe", move |_, id: Value| {
        let id = match id {
            Value::Integer(i) => u64::try_from(i).ok(),
            Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => Some(n as u64),
            _ => None,
        }
        .ok_or_else(|| ScriptError::api("unsubscribe(id) expects a subscription id"))?;
        Ok(dispatcher.cancel(SubscriptionId(id)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(lua: &Lua, code: &str) -> Result<(SubscriptionConfig, Option<Function>), ScriptError> {
        let table: Table = lua.load(code).eval().unwrap();
        parse_config(&table)
    }

    #[test]
    fn full_config() {
        let lua = Lua::new();
        let (cfg, cb) = parse(
            &lua,
            r#"return {
                services = { { service = "180D", chars = { "2A37", "2a38" } } },
                Mode = "Batched", MaxRate = 250, Callback = function() end,
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.selectors, vec![SubscribeOptions::new("180d", &["2a37", "2a38"])]);
        assert_eq!(cfg.mode, StreamMode::Batched);
        assert_eq!(cfg.max_rate, Duration::from_millis(250));
        assert!(cb.is_some());
    }

    #[test]
    fn defaults_and_fallbacks() {
        let lua = Lua::new();
        let (cfg, cb) = parse(&lua, r#"return { Mode = "Whenever" }"#).unwrap();
        assert!(cfg.selectors.is_empty());
        assert_eq!(cfg.mode, StreamMode::EveryUpdate);
        assert_eq!(cfg.max_rate, Duration::ZERO);
        assert!(cb.is_none());
    }

    #[test]
    fn malformed_fields() {
        let lua = Lua::new();
        for code in [
            "return { services = 5 }",
            "return { services = { 'x' } }",
            "return { services = { { service = 1 } } }",
            "return { services = { { service = 'a', chars = 'b' } } }",
            "return { MaxRate = 'fast' }",
            "return { Callback = 3 }",
        ] {
            let err = parse(&lua, code).unwrap_err();
            assert!(
                err.message.starts_with("Error parsing subscription config: "),
                "{code}: {err}"
            );
        }
    }
}

//! `blim.characteristic(service, char)` and its handle methods.

use crate::barrier::guard_host_fn;
use crate::error::ScriptError;
use crate::suspend::{suspendable, Begun, HostOutcome, Request};
use crate::types::json_to_lua;
use blim_device::{CharacteristicInfo, Connection, Device, Properties};
use blim_runtime::config::DeviceConfig;
use mlua::{Function, Lua, MultiValue, Table, Value};
use std::sync::Arc;
use tracing::debug;

pub(super) fn characteristic_fn(
    lua: &Lua,
    device: &Arc<dyn Device>,
    config: &DeviceConfig,
) -> mlua::Result<Function> {
    let device = Arc::clone(device);
    let config = config.clone();
    guard_host_fn(lua, "characteristic", move |lua, args: (Value, Value)| {
        let (Value::String(service), Value::String(uuid)) = args else {
            return Err(ScriptError::api(
                "characteristic(service_uuid, char_uuid) expects two string arguments",
            )
            .into());
        };
        let connection = device
            .connection()
            .ok_or_else(|| ScriptError::runtime("no connection available"))?;
        let info = connection
            .characteristic(&service.to_str()?, &uuid.to_str()?)
            .map_err(|e| ScriptError::runtime(format!("characteristic not found: {e}")))?;
        handle_table(lua, connection, &info, &config)
    })
}

fn handle_table(
    lua: &Lua,
    connection: Arc<dyn Connection>,
    info: &CharacteristicInfo,
    config: &DeviceConfig,
) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("uuid", info.uuid.as_str())?;
    t.set("service", info.service.as_str())?;
    if let Some(name) = &info.name {
        t.set("name", name.as_str())?;
    }
    t.set("properties", properties_table(lua, info.properties)?)?;
    t.set("descriptors", descriptors_table(lua, info)?)?;
    t.set("has_parser", info.has_parser)?;
    t.set("requires_authentication", info.requires_authentication)?;

    t.set("read", read_fn(lua, &connection, info, config)?)?;
    t.set("write", write_fn(lua, &connection, info, config)?)?;
    if info.has_parser {
        t.set("parse", parse_fn(lua, &connection, info)?)?;
    }
    Ok(t)
}

/// Array of `{value, name}` in bit order, also keyed by property name.
fn properties_table(lua: &Lua, properties: Properties) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    let mut idx = 0;
    for (bit, key, name) in Properties::NAMED {
        if !properties.contains(bit) {
            continue;
        }
        let entry = lua.create_table()?;
        entry.set("value", bit.bits())?;
        entry.set("name", name)?;
        idx += 1;
        t.raw_set(idx, entry.clone())?;
        t.set(key, entry)?;
    }
    Ok(t)
}

fn descriptors_table(lua: &Lua, info: &CharacteristicInfo) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    for (idx, d) in info.descriptors.iter().enumerate() {
        let entry = lua.create_table()?;
        entry.set("uuid", d.uuid.as_str())?;
        entry.set("handle", d.handle)?;
        if let Some(name) = &d.name {
            entry.set("name", name.as_str())?;
        }
        if let Some(value) = &d.value {
            entry.set("value", lua.create_string(value)?)?;
        }
        t.raw_set(idx + 1, entry)?;
    }
    Ok(t)
}

fn read_fn(
    lua: &Lua,
    connection: &Arc<dyn Connection>,
    info: &CharacteristicInfo,
    config: &DeviceConfig,
) -> mlua::Result<Function> {
    let connection = Arc::clone(connection);
    let (service, uuid) = (info.service.clone(), info.uuid.clone());
    let timeout = config.read_timeout();
    suspendable(lua, "read", move |_, _defer, _args: MultiValue| {
        let connection = Arc::clone(&connection);
        let (service, uuid) = (service.clone(), uuid.clone());
        Ok(Begun::Suspend(Request::Host(Box::new(move || {
            match connection.read(&service, &uuid, timeout) {
                Ok(value) => HostOutcome::Bytes(value),
                Err(e) => {
                    debug!(service = %service, characteristic = %uuid, error = %e, "read failed");
                    HostOutcome::Failed(format!("read() failed: {e}"))
                }
            }
        }))))
    })
}

fn write_fn(
    lua: &Lua,
    connection: &Arc<dyn Connection>,
    info: &CharacteristicInfo,
    config: &DeviceConfig,
) -> mlua::Result<Function> {
    let connection = Arc::clone(connection);
    let (service, uuid) = (info.service.clone(), info.uuid.clone());
    let timeout = config.write_timeout();
    suspendable(lua, "write", move |_, _defer, args: MultiValue| {
        let mut args = args.into_iter().peekable();
        if matches!(args.peek(), Some(Value::Table(_))) {
            args.next();
        }
        let data = match args.next() {
            Some(Value::String(s)) => s.as_bytes().to_vec(),
            _ => {
                return Err(ScriptError::api(
                    "write(data, [with_response]) expects string as first argument",
                )
                .into())
            }
        };
        let with_response = match args.next() {
            None | Some(Value::Nil) => true,
            Some(Value::Boolean(b)) => b,
            Some(_) => {
                return Err(ScriptError::api(
                    "write(data, [with_response]) expects boolean as second argument",
                )
                .into())
            }
        };

        let connection = Arc::clone(&connection);
        let (service, uuid) = (service.clone(), uuid.clone());
        Ok(Begun::Suspend(Request::Host(Box::new(move || {
            match connection.write(&service, &uuid, &data, with_response, timeout) {
                Ok(()) => HostOutcome::Done,
                Err(e) => {
                    debug!(service = %service, characteristic = %uuid, error = %e, "write failed");
                    HostOutcome::Failed(format!("write() failed: {e}"))
                }
            }
        }))))
    })
}

fn parse_fn(
    lua: &Lua,
    connection: &Arc<dyn Connection>,
    info: &CharacteristicInfo,
) -> mlua::Result<Function> {
    let connection = Arc::clone(connection);
    let (service, uuid) = (info.service.clone(), info.uuid.clone());
    guard_host_fn(lua, "parse", move |lua, args: MultiValue| {
        let value = args
            .into_iter()
            .find_map(|v| match v {
                Value::String(s) => Some(s.as_bytes().to_vec()),
                _ => None,
            })
            .ok_or_else(|| ScriptError::api("parse(value) expects a string argument"))?;
        match connection.parse(&service, &uuid, &value) {
            Ok(Some(parsed)) => json_to_lua(lua, &parsed),
            Ok(None) => Ok(Value::Nil),
            Err(e) => {
                debug!(characteristic = %uuid, error = %e, "parse failed");
                Ok(Value::Nil)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend;
    use blim_device::testing::MemoryPeripheral;
    use blim_device::{DescriptorInfo, DeviceError};
    use std::time::Duration;

    fn setup() -> (Lua, Arc<MemoryPeripheral>) {
        let lua = Lua::new();
        suspend::install(&lua).unwrap();
        let p = MemoryPeripheral::new("p");
        p.add_characteristic(
            CharacteristicInfo::new("180d", "2a37", Properties::READ | Properties::WRITE | Properties::NOTIFY)
                .with_name("Heart Rate Measurement")
                .with_descriptor(DescriptorInfo {
                    uuid: "2902".into(),
                    handle: 12,
                    name: Some("Client Characteristic Configuration".into()),
                    value: Some(vec![1, 0]),
                }),
        );
        p.add_characteristic(CharacteristicInfo::new("180d", "2a38", Properties::READ));
        let device: Arc<dyn Device> = p.clone();
        lua.globals()
            .set(
                "characteristic",
                characteristic_fn(&lua, &device, &DeviceConfig::default()).unwrap(),
            )
            .unwrap();
        (lua, p)
    }

    #[test]
    fn handle_fields() {
        let (lua, _p) = setup();
        let (name, first, notify, desc, parser): (String, String, i64, i64, bool) = lua
            .load(
                r#"
                local c = characteristic("180D", "2A37")
                return c.name, c.properties[1].name, c.properties.notify.value,
                       c.descriptors[1].handle, c.has_parser
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(name, "Heart Rate Measurement");
        assert_eq!(first, "Read");
        assert_eq!(notify, 0x10);
        assert_eq!(desc, 12);
        assert!(!parser);
    }

    #[test]
    fn read_and_failed_read() {
        let (lua, p) = setup();
        p.set_read_value("180d", "2a38", vec![0x55]);
        let v: mlua::String = lua
            .load(r#"return characteristic("180d", "2a38"):read()"#)
            .eval()
            .unwrap();
        assert_eq!(v.as_bytes().to_vec(), vec![0x55]);

        p.fail_reads("180d", "2a38", DeviceError::timeout("read", Duration::from_secs(5)));
        let (v, err): (Value, String) = lua
            .load(r#"return characteristic("180d", "2a38"):read()"#)
            .eval()
            .unwrap();
        assert!(v.is_nil());
        assert_eq!(err, "read() failed: read timed out after 5000ms");
    }

    #[test]
    fn write_defaults_to_with_response() {
        let (lua, p) = setup();
        let ok: bool = lua
            .load(r#"return characteristic("180d", "2a37"):write("\1\2")"#)
            .eval()
            .unwrap();
        assert!(ok);
        let writes = p.writes();
        assert_eq!(writes[0].data, vec![1, 2]);
        assert!(writes[0].with_response);

        let (ok, err): (Value, String) = lua
            .load(r#"return characteristic("180d", "2a37"):write("x", false)"#)
            .eval()
            .unwrap();
        assert!(ok.is_nil());
        assert!(err.starts_with("write() failed:"), "{err}");
    }

    #[test]
    fn write_argument_errors_are_raised() {
        let (lua, _p) = setup();
        let err = lua
            .load(r#"characteristic("180d", "2a37"):write(5)"#)
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("expects string as first argument"), "{err}");
        let err = lua
            .load(r#"characteristic("180d", "2a37"):write("x", "yes")"#)
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("expects boolean as second argument"), "{err}");
    }

    #[test]
    fn lookup_errors() {
        let (lua, _p) = setup();
        let err = lua.load("characteristic(1)").exec().unwrap_err();
        assert!(err.to_string().contains("expects two string arguments"), "{err}");
        let err = lua.load(r#"characteristic("180d", "ffff")"#).exec().unwrap_err();
        assert!(
            err.to_string().contains("characteristic not found: characteristic \"ffff\" not found"),
            "{err}"
        );
    }

    #[test]
    fn parse_only_with_parser() {
        let (lua, p) = setup();
        let missing: bool = lua
            .load(r#"return characteristic("180d", "2a37").parse == nil"#)
            .eval()
            .unwrap();
        assert!(missing);

        p.register_parser("180d", "2a37", |v| {
            (v.len() == 2).then(|| serde_json::json!({ "bpm": v[1] }))
        });
        let (bpm, bad): (i64, bool) = lua
            .load(
                r#"
                local c = characteristic("180d", "2a37")
                return c:parse("\0\72").bpm, c:parse("\0") == nil
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(bpm, 72);
        assert!(bad);
    }
}

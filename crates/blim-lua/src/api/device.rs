//! `blim.device` and `blim.list()`.

use crate::barrier::guard_host_fn;
use crate::types::hex_upper;
use blim_device::{Device, DeviceInfo};
use mlua::{Function, Lua, Table};
use std::sync::Arc;

pub(super) fn device_table(lua: &Lua, info: &DeviceInfo) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("id", info.id.as_str())?;
    t.set("address", info.address.as_str())?;
    t.set("name", info.name.as_str())?;
    t.set("rssi", info.rssi)?;
    t.set("connectable", info.connectable)?;
    if let Some(tx_power) = info.tx_power {
        t.set("tx_power", tx_power)?;
    }
    t.set(
        "advertised_services",
        lua.create_sequence_from(info.advertised_services.iter().map(String::as_str))?,
    )?;

    if !info.manufacturer_data.is_empty() {
        let mfg = lua.create_table()?;
        mfg.set("value", hex_upper(&info.manufacturer_data))?;
        t.set("manufacturer_data", mfg)?;
    }

    let service_data = lua.create_table()?;
    for (uuid, data) in &info.service_data {
        service_data.set(uuid.as_str(), hex_upper(data))?;
    }
    t.set("service_data", service_data)?;
    Ok(t)
}

pub(super) fn list_fn(lua: &Lua, device: &Arc<dyn Device>) -> mlua::Result<Function> {
    let device = Arc::clone(device);
    guard_host_fn(lua, "list", move |lua, ()| {
        let out = lua.create_table()?;
        let Some(connection) = device.connection() else {
            return Ok(out);
        };
        for (idx, service) in connection.services().iter().enumerate() {
            out.raw_set(idx + 1, service.uuid.as_str())?;

            let entry = lua.create_table()?;
            if let Some(name) = &service.name {
                entry.set("name", name.as_str())?;
            }
            entry.set(
                "characteristics",
                lua.create_sequence_from(service.characteristics.iter().map(|c| c.uuid.as_str()))?,
            )?;
            out.set(service.uuid.as_str(), entry)?;
        }
        Ok(out)
    })
}

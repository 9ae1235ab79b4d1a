//! The `blim` table scripts talk to (also reachable as `ble`).
//!
//! [`install_core`] puts the device-independent part into every runtime:
//! `blim.sleep` and `blim.log`. [`BleApi`] is a [`RuntimeExtension`] adding
//! the device surface on top:
//!
//! | name                      | returns                                  |
//! |---------------------------|------------------------------------------|
//! | `blim.device`             | advertisement snapshot table             |
//! | `blim.list()`             | services and their characteristics       |
//! | `blim.characteristic(s,c)`| handle with `read`, `write`, `parse`     |
//! | `blim.subscribe{...}`     | subscription id                          |
//! | `blim.unsubscribe(id)`    | `true` if the subscription existed       |

mod characteristic;
mod device;
mod subscribe;

use crate::barrier::guard_host_fn;
use crate::dispatch::SubscriptionDispatcher;
use crate::engine::{EngineHandle, Runtime, RuntimeExtension};
use crate::suspend;
use blim_device::Device;
use blim_runtime::config::{DeviceConfig, DispatchConfig};
use mlua::{Lua, Table};
use std::sync::Arc;

/// Global name of the API table.
pub const API_GLOBAL: &str = "blim";

/// Alias kept for scripts written against the `ble` name.
pub const API_ALIAS: &str = "ble";

/// Installs the device-independent part of the API.
pub fn install_core(lua: &Lua) -> mlua::Result<()> {
    let api = lua.create_table()?;
    api.set("sleep", suspend::sleep_fn(lua)?)?;
    api.set(
        "log",
        guard_host_fn(lua, "log", |_, (level, message): (String, String)| {
            match level.to_ascii_lowercase().as_str() {
                "trace" => tracing::trace!(target: "blim::script", "[lua] {message}"),
                "debug" => tracing::debug!(target: "blim::script", "[lua] {message}"),
                "warn" | "warning" => tracing::warn!(target: "blim::script", "[lua] {message}"),
                "error" => tracing::error!(target: "blim::script", "[lua] {message}"),
                _ => tracing::info!(target: "blim::script", "[lua] {message}"),
            }
            Ok(())
        })?,
    )?;

    lua.globals().set(API_GLOBAL, api.clone())?;
    lua.globals().set(API_ALIAS, api.clone())?;
    let loaded: Table = lua.globals().get::<Table>("package")?.get("loaded")?;
    loaded.set(API_GLOBAL, api)
}

fn api_table(lua: &Lua) -> mlua::Result<Table> {
    lua.globals().get(API_GLOBAL)
}

/// Exposes a [`Device`] to scripts.
///
/// # Example
///
/// ```
/// use blim_device::testing::MemoryPeripheral;
/// use blim_lua::{BleApi, ExecContext, ScriptEngine};
/// use std::sync::Arc;
///
/// let engine = ScriptEngine::with_defaults()?;
/// let peripheral = MemoryPeripheral::new("thermo");
/// let api = BleApi::with_defaults(peripheral, &engine);
/// engine.install(Arc::new(api))?;
///
/// engine.execute_script(&ExecContext::background(), r#"print(blim.device.name)"#)?;
/// assert_eq!(engine.output().try_recv().unwrap().content, "thermo\n");
/// # Ok::<(), blim_lua::ScriptError>(())
/// ```
pub struct BleApi {
    device: Arc<dyn Device>,
    config: DeviceConfig,
    dispatcher: Arc<SubscriptionDispatcher>,
}

impl BleApi {
    pub fn new(
        device: Arc<dyn Device>,
        engine: &crate::ScriptEngine,
        device_config: DeviceConfig,
        dispatch_config: &DispatchConfig,
    ) -> Self {
        Self {
            device,
            config: device_config,
            dispatcher: Arc::new(SubscriptionDispatcher::new(
                engine.handle(),
                dispatch_config,
            )),
        }
    }

    /// [`new`](Self::new) with default device and dispatch settings.
    pub fn with_defaults(device: Arc<dyn Device>, engine: &crate::ScriptEngine) -> Self {
        Self::new(
            device,
            engine,
            DeviceConfig::default(),
            &DispatchConfig::default(),
        )
    }

    /// The dispatcher owning this API's subscriptions.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<SubscriptionDispatcher> {
        &self.dispatcher
    }
}

impl RuntimeExtension for BleApi {
    fn name(&self) -> &str {
        "blim"
    }

    fn install(&self, lua: &Lua, _engine: &EngineHandle) -> mlua::Result<()> {
        let api = api_table(lua)?;
        api.set("device", device::device_table(lua, &self.device.info())?)?;
        api.set("list", device::list_fn(lua, &self.device)?)?;
        api.set(
            "characteristic",
            characteristic::characteristic_fn(lua, &self.device, &self.config)?,
        )?;
        api.set(
            "subscribe",
            subscribe::subscribe_fn(lua, &self.device, &self.dispatcher)?,
        )?;
        api.set(
            "unsubscribe",
            subscribe::unsubscribe_fn(lua, &self.dispatcher)?,
        )?;
        Ok(())
    }

    fn on_reset(&self, runtime: &Runtime) {
        self.dispatcher.retire(runtime.generation());
    }
}

//! Arena of script callbacks held by the host.
//!
//! A [`CallbackRef`] is an index into a table owned by the runtime (kept in
//! Lua app data). Host code never touches the function itself; it passes
//! the reference back to [`CallbackTable::function`] under the engine lock.
//!
//! References carry the generation of the runtime that minted them. After
//! [`ScriptEngine::reset`](crate::ScriptEngine::reset) the new runtime has a
//! new generation and an empty table, so stale references resolve to `None`
//! instead of to a foreign function.

use mlua::{Function, Lua, RegistryKey};
use std::collections::HashMap;
use std::fmt;

/// Opaque handle to a script function registered with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackRef {
    generation: u64,
    slot: u64,
}

impl CallbackRef {
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}.{}", self.generation, self.slot)
    }
}

/// Per-runtime slot table.
pub struct CallbackTable {
    generation: u64,
    next: u64,
    slots: HashMap<u64, RegistryKey>,
}

impl CallbackTable {
    /// Attaches an empty table for a runtime of the given generation.
    pub fn install(lua: &Lua, generation: u64) {
        lua.set_app_data(Self {
            generation,
            next: 1,
            slots: HashMap::new(),
        });
    }

    /// Pins `func` in the registry and returns its handle.
    pub fn register(lua: &Lua, func: Function) -> mlua::Result<CallbackRef> {
        let key = lua.create_registry_value(func)?;
        let mut table = lua
            .app_data_mut::<Self>()
            .ok_or_else(|| mlua::Error::RuntimeError("callback table missing".into()))?;
        let slot = table.next;
        table.next += 1;
        table.slots.insert(slot, key);
        Ok(CallbackRef {
            generation: table.generation,
            slot,
        })
    }

    /// Resolves a handle. `None` if released or minted by another runtime.
    pub fn function(lua: &Lua, callback: CallbackRef) -> Option<Function> {
        let table = lua.app_data_ref::<Self>()?;
        if table.generation != callback.generation {
            return None;
        }
        let key = table.slots.get(&callback.slot)?;
        lua.registry_value::<Function>(key).ok()
    }

    /// Unpins a callback. Returns `false` if it was not registered here.
    pub fn release(lua: &Lua, callback: CallbackRef) -> bool {
        let key = {
            let Some(mut table) = lua.app_data_mut::<Self>() else {
                return false;
            };
            if table.generation != callback.generation {
                return false;
            }
            table.slots.remove(&callback.slot)
        };
        match key {
            Some(key) => {
                if let Err(e) = lua.remove_registry_value(key) {
                    tracing::warn!(callback = %callback, error = %e, "failed to unpin callback");
                }
                true
            }
            None => false,
        }
    }

    /// Number of live callbacks.
    pub fn len(lua: &Lua) -> usize {
        lua.app_data_ref::<Self>().map_or(0, |t| t.slots.len())
    }
}

//! Fault containment at the host/script boundary.
//!
//! Two crossings are guarded the same way:
//!
//! ```text
//!   script ──call──▶ host function      guard_host_fn()
//!   host   ──call──▶ script callback    contain()
//! ```
//!
//! Expected failures (`Err` values) pass through untouched. A panic in host
//! glue is caught, logged with a backtrace, and turned into a runtime
//! [`ScriptError`] `"<name>() faulted in host code"`.

use crate::error::{HostPanic, ScriptError};
use mlua::{FromLuaMulti, Function, IntoLuaMulti, Lua};
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Creates a Lua function whose host body cannot unwind into the runtime.
pub fn guard_host_fn<A, R, F>(lua: &Lua, name: impl Into<String>, f: F) -> mlua::Result<Function>
where
    A: FromLuaMulti,
    R: IntoLuaMulti,
    F: Fn(&Lua, A) -> mlua::Result<R> + Send + 'static,
{
    let name = name.into();
    lua.create_function(move |lua, args: A| {
        match panic::catch_unwind(AssertUnwindSafe(|| f(lua, args))) {
            Ok(result) => result,
            Err(payload) => Err(host_fault(&name, payload.as_ref()).into()),
        }
    })
}

/// Runs a host-initiated call into the script, converting both script
/// errors and host panics into [`ScriptError`].
pub fn contain<R>(name: &str, f: impl FnOnce() -> mlua::Result<R>) -> Result<R, ScriptError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ScriptError::from_lua(&err, name)),
        Err(payload) => Err(host_fault(name, payload.as_ref())),
    }
}

/// Leaves the runtime reusable after a failed callback.
///
/// Value stacks are unwound by the failed call itself; this drops registry
/// slots and garbage that the aborted frame left behind.
pub fn recover_stack(lua: &Lua) {
    lua.expire_registry_values();
    if let Err(e) = lua.gc_collect() {
        warn!(error = %e, "garbage collection after callback failure failed");
    }
    debug!(used = lua.used_memory(), "runtime recovered after callback failure");
}

fn host_fault(name: &str, payload: &(dyn Any + Send)) -> ScriptError {
    let message = panic_message(payload);
    error!(
        function = name,
        panic = %message,
        backtrace = %Backtrace::force_capture(),
        "host code faulted at script boundary"
    );
    ScriptError::runtime(format!("{name}() faulted in host code")).with_cause(HostPanic(message))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

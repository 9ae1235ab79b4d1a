//! Host calls that give up the runtime lock while they wait.
//!
//! A script started by the engine runs inside a *driver* coroutine. A
//! suspendable host function called from that coroutine yields a private
//! token and a [`Request`] back to the engine, which releases the runtime
//! lock, performs the request, and resumes the coroutine with its results
//! under the lock again:
//!
//! ```text
//!   driver (host)                    coroutine (script)
//!   ─────────────                    ──────────────────
//!   lock; resume ───────────────────▶ ... blim.sleep(100)
//!        ◀──────────── yield(token, Sleep(100ms))
//!   unlock; wait 100ms               (suspended, callbacks may run)
//!   lock; resume ───────────────────▶ ... c:read()
//!        ◀──────────── yield(token, Host(job))
//!   unlock; job()                    (suspended, callbacks may run)
//!   lock; resume(value, err) ───────▶ ... continues
//! ```
//!
//! Outside a driver coroutine (inside a subscription callback, or inside a
//! coroutine the script created itself) the same functions complete in place.

use crate::barrier::guard_host_fn;
use crate::error::ScriptError;
use mlua::{FromLuaMulti, Function, Lua, MultiValue, Table, Thread, UserData, Value};
use std::time::Duration;

const DRIVERS_KEY: &str = "blim.suspend.drivers";
const TOKEN_KEY: &str = "blim.suspend.token";
const WRAP_KEY: &str = "blim.suspend.wrap";

const WRAPPER: &str = r#"
local running, isyieldable, yield, drivers, token, error = ...
local function resumed(ok, ...)
  if ok then
    return ...
  end
  error((...), 0)
end
local function finish(ready, ...)
  if ready then
    return ...
  end
  return resumed(yield(token, ...))
end
return function(begin)
  return function(...)
    local co = running()
    return finish(begin(drivers[co] ~= nil and isyieldable(), ...))
  end
end
"#;

/// Blocking work run by the driver with the runtime lock released.
pub type HostJob = Box<dyn FnOnce() -> HostOutcome + Send>;

/// What a [`HostJob`] hands back to the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    /// `(bytes, nil)`
    Bytes(Vec<u8>),
    /// `(true, nil)`
    Done,
    /// `(nil, message)`
    Failed(String),
    /// A single integer.
    Integer(i64),
    /// Raised in the script as a runtime error.
    Raised(String),
}

impl HostOutcome {
    /// Converts the outcome into the values returned to the script.
    ///
    /// # Errors
    ///
    /// [`Raised`](Self::Raised) becomes a runtime error.
    pub fn into_lua(self, lua: &Lua) -> mlua::Result<MultiValue> {
        let values = match self {
            Self::Bytes(bytes) => vec![Value::String(lua.create_string(bytes)?), Value::Nil],
            Self::Done => vec![Value::Boolean(true), Value::Nil],
            Self::Failed(message) => vec![Value::Nil, Value::String(lua.create_string(message)?)],
            Self::Integer(i) => vec![Value::Integer(i)],
            Self::Raised(message) => return Err(ScriptError::runtime(message).into()),
        };
        Ok(MultiValue::from_iter(values))
    }

    /// Values a driver resumes the coroutine with: a success flag, then
    /// either the results or the error message.
    pub fn into_resume(self, lua: &Lua) -> mlua::Result<MultiValue> {
        let mut values = vec![];
        match self {
            Self::Raised(message) => {
                values.push(Value::Boolean(false));
                values.push(Value::String(lua.create_string(message)?));
            }
            other => {
                values.push(Value::Boolean(true));
                values.extend(other.into_lua(lua)?);
            }
        }
        Ok(MultiValue::from_iter(values))
    }
}

/// Work a driver performs on behalf of a suspended script.
pub enum Request {
    Sleep(Duration),
    Host(HostJob),
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sleep(d) => f.debug_tuple("Sleep").field(d).finish(),
            Self::Host(_) => f.write_str("Host(..)"),
        }
    }
}

/// How a suspendable host function continues.
pub enum Begun {
    /// Finished in place with these results.
    Ready(MultiValue),
    /// Hand the request to the driver.
    Suspend(Request),
}

struct Suspension(Option<Request>);

impl UserData for Suspension {}

/// Prepares a fresh runtime for suspendable functions.
pub fn install(lua: &Lua) -> mlua::Result<()> {
    let drivers = lua.create_table()?;
    let weak_keys = lua.create_table()?;
    weak_keys.set("__mode", "k")?;
    drivers.set_metatable(Some(weak_keys));
    let token = lua.create_table()?;

    let coroutine: Table = lua.globals().get("coroutine")?;
    let wrap = lua
        .load(WRAPPER)
        .set_name("=blim.suspend")
        .call::<Function>((
            coroutine.get::<Function>("running")?,
            coroutine.get::<Function>("isyieldable")?,
            coroutine.get::<Function>("yield")?,
            drivers.clone(),
            token.clone(),
            lua.globals().get::<Function>("error")?,
        ))?;

    lua.set_named_registry_value(DRIVERS_KEY, drivers)?;
    lua.set_named_registry_value(TOKEN_KEY, token)?;
    lua.set_named_registry_value(WRAP_KEY, wrap)
}

/// Creates a script function that may suspend its caller.
///
/// `begin` receives `defer = true` when the caller is a driver coroutine
/// that can be suspended; it must then either finish in place or return a
/// [`Request`]. With `defer = false` a returned request is completed in place
/// on the calling thread.
pub fn suspendable<A, F>(lua: &Lua, name: &str, begin: F) -> mlua::Result<Function>
where
    A: FromLuaMulti,
    F: Fn(&Lua, bool, A) -> mlua::Result<Begun> + Send + 'static,
{
    let begin = guard_host_fn(lua, name, move |lua, (defer, args): (bool, A)| {
        let mut out = Vec::with_capacity(3);
        match begin(lua, defer, args)? {
            Begun::Ready(values) => {
                out.push(Value::Boolean(true));
                out.extend(values);
            }
            Begun::Suspend(request) if defer => {
                out.push(Value::Boolean(false));
                out.push(Value::UserData(
                    lua.create_userdata(Suspension(Some(request)))?,
                ));
            }
            Begun::Suspend(request) => {
                out.push(Value::Boolean(true));
                out.extend(complete(lua, request)?);
            }
        }
        Ok(MultiValue::from_iter(out))
    })?;
    let wrap: Function = lua.named_registry_value(WRAP_KEY)?;
    wrap.call(begin)
}

/// Runs a request on the current thread.
fn complete(lua: &Lua, request: Request) -> mlua::Result<MultiValue> {
    match request {
        Request::Sleep(duration) => {
            std::thread::sleep(duration);
            Ok(MultiValue::new())
        }
        Request::Host(job) => job().into_lua(lua),
    }
}

/// Marks `thread` as a driver coroutine whose suspendable calls yield to the host.
pub fn register_driver(lua: &Lua, thread: &Thread) -> mlua::Result<()> {
    let drivers: Table = lua.named_registry_value(DRIVERS_KEY)?;
    drivers.set(thread.clone(), true)
}

/// Takes the request out of the values yielded by a driver coroutine.
///
/// Returns `None` if they are not a suspension (a plain `coroutine.yield`).
pub fn requested(lua: &Lua, yielded: &MultiValue) -> mlua::Result<Option<Request>> {
    let token: Table = lua.named_registry_value(TOKEN_KEY)?;
    let mut values = yielded.iter();
    match (values.next(), values.next()) {
        (Some(Value::Table(t)), Some(Value::UserData(ud))) if t.to_pointer() == token.to_pointer() => {
            let mut suspension = ud.borrow_mut::<Suspension>()?;
            Ok(suspension.0.take())
        }
        _ => Ok(None),
    }
}

/// Creates `blim.sleep`.
pub fn sleep_fn(lua: &Lua) -> mlua::Result<Function> {
    suspendable(lua, "sleep", |_, defer, ms: Value| {
        let duration = Duration::from_millis(validate_ms(&ms)?);
        if defer {
            return Ok(Begun::Suspend(Request::Sleep(duration)));
        }
        std::thread::sleep(duration);
        Ok(Begun::Ready(MultiValue::new()))
    })
}

fn validate_ms(ms: &Value) -> Result<u64, ScriptError> {
    let ms = match ms {
        Value::Integer(i) => *i as f64,
        Value::Number(n) => *n,
        Value::String(s) => s
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or_else(|| ScriptError::api("sleep(milliseconds) expects a number argument"))?,
        _ => return Err(ScriptError::api("sleep(milliseconds) expects a number argument")),
    };
    if ms.is_nan() || ms < 0.0 {
        return Err(ScriptError::api(
            "sleep(milliseconds) expects a non-negative number",
        ));
    }
    Ok(ms as u64)
}

//! The script engine: one sandboxed Lua runtime behind one lock.
//!
//! # Lifecycle
//!
//! ```text
//!   new() ──▶ Ready ──execute/call──▶ Executing ──▶ Ready
//!               ▲                                     │
//!               └──────────────── reset() ◀───────────┘
//!
//!   close() ──▶ Closed (every call fails with "engine is closed")
//! ```
//!
//! # Locking
//!
//! All runtime access goes through [`ScriptEngine::run_exclusive`]. Scripts
//! run inside a driver coroutine; `blim.sleep` and characteristic I/O yield
//! to the driver, which drops the lock while it waits so subscription
//! callbacks can run in between. While the driver runs, a watchdog hook checks
//! the execution context every `watchdog_instructions` VM instructions and
//! aborts the script once the context is done. `coroutine.resume` and
//! `coroutine.wrap` move the hook onto whichever coroutine the script resumes.

use crate::api;
use crate::callback::CallbackTable;
use crate::context::ExecContext;
use crate::error::ScriptError;
use crate::suspend::{self, HostOutcome, Request};
use crate::{json, sandbox};
use blim_runtime::config::EngineConfig;
use blim_runtime::output::{OutputPipe, OutputRecord};
use mlua::{
    Function, HookTriggers, Lua, MultiValue, Table, Thread, ThreadStatus, Value, VmState,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chunk name used when `execute_script` loads text itself.
pub const DEFAULT_CHUNK_NAME: &str = "script";

const RESUME_KEY: &str = "blim.engine.resume";

const COROUTINE_WRAP: &str = r#"
local create, resume, error, pack, unpack = ...
return function(f)
  local co = create(f)
  return function(...)
    local r = pack(resume(co, ...))
    if r[1] then
      return unpack(r, 2, r.n)
    end
    error(r[2], 0)
  end
end
"#;

/// Host functionality installed into every runtime the engine builds.
///
/// Extensions are installed when registered and re-installed into the fresh
/// runtime after every [`ScriptEngine::reset`].
pub trait RuntimeExtension: Send + Sync {
    /// Name used in logs and setup errors.
    fn name(&self) -> &str;

    /// Installs globals into `lua`. Called with the engine lock held; must
    /// not call back into the engine.
    fn install(&self, lua: &Lua, engine: &EngineHandle) -> mlua::Result<()>;

    /// Called with the engine lock held, before `runtime` is torn down by a
    /// reset or close. Must not block on the engine.
    fn on_reset(&self, _runtime: &Runtime) {}
}

/// Non-owning handle to an engine, held by extensions.
#[derive(Clone)]
pub struct EngineHandle(Weak<EngineShared>);

impl EngineHandle {
    /// The engine, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<ScriptEngine> {
        self.0.upgrade().map(|shared| ScriptEngine { shared })
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EngineHandle")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}

struct PendingChunk {
    func: Function,
    name: String,
}

/// Runtime state reachable inside [`ScriptEngine::run_exclusive`].
pub struct Runtime {
    lua: Lua,
    pending: Option<PendingChunk>,
    generation: u64,
}

impl Runtime {
    #[must_use]
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Identifies this runtime instance; changes on every reset.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Name of the loaded-but-not-executed chunk, if any.
    #[must_use]
    pub fn pending_chunk(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.name.as_str())
    }
}

struct EngineShared {
    runtime: Mutex<Option<Runtime>>,
    extensions: Mutex<Vec<Arc<dyn RuntimeExtension>>>,
    output: Arc<OutputPipe>,
    config: EngineConfig,
    generation: AtomicU64,
    closed: AtomicBool,
}

/// Owns a sandboxed Lua runtime and serializes every access to it.
///
/// Cloning yields another handle to the same engine.
///
/// # Example
///
/// ```
/// use blim_lua::{ExecContext, ScriptEngine};
///
/// let engine = ScriptEngine::with_defaults()?;
/// engine.execute_script(&ExecContext::background(), r#"print("hello")"#)?;
///
/// let record = engine.output().try_recv().expect("captured output");
/// assert_eq!(record.content, "hello\n");
/// # Ok::<(), blim_lua::ScriptError>(())
/// ```
#[derive(Clone)]
pub struct ScriptEngine {
    shared: Arc<EngineShared>,
}

enum Step {
    Finished,
    Sleep(Duration),
    Host(suspend::HostJob),
}

enum Resume {
    Args(MultiValue),
    Outcome(HostOutcome),
    Empty,
}

fn setup_error(err: &mlua::Error) -> ScriptError {
    ScriptError::from_lua(err, "engine")
}

impl ScriptEngine {
    /// Creates an engine with a fresh runtime.
    ///
    /// # Errors
    ///
    /// An `api` error if `output_capacity` is zero, or the setup error if the
    /// runtime cannot be built.
    pub fn new(config: EngineConfig) -> Result<Self, ScriptError> {
        if config.output_capacity == 0 {
            return Err(ScriptError::api("output capacity must be positive"));
        }
        let shared = Arc::new(EngineShared {
            runtime: Mutex::new(None),
            extensions: Mutex::new(Vec::new()),
            output: Arc::new(OutputPipe::new(config.output_capacity)),
            config,
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let engine = Self { shared };
        {
            let mut slot = engine.shared.runtime.lock();
            *slot = Some(engine.build_runtime()?);
        }
        info!(
            output_capacity = engine.shared.config.output_capacity,
            "script engine initialized with output capture"
        );
        Ok(engine)
    }

    /// [`new`](Self::new) with default configuration.
    pub fn with_defaults() -> Result<Self, ScriptError> {
        Self::new(EngineConfig::default())
    }

    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle(Arc::downgrade(&self.shared))
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// The pipe receiving everything scripts print.
    #[must_use]
    pub fn output(&self) -> Arc<OutputPipe> {
        Arc::clone(&self.shared.output)
    }

    /// Pushes a record onto the output pipe.
    pub fn emit(&self, record: OutputRecord) {
        self.shared.output.send(record);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn unavailable(&self) -> ScriptError {
        if self.is_closed() {
            ScriptError::api("engine is closed")
        } else {
            ScriptError::api("runtime is not initialized")
        }
    }

    fn build_runtime(&self) -> Result<Runtime, ScriptError> {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let lua = Lua::new();
        let handle = self.handle();

        CallbackTable::install(&lua, generation);
        suspend::install(&lua).map_err(|e| setup_error(&e))?;
        guard_coroutines(&lua).map_err(|e| setup_error(&e))?;
        sandbox::install(&lua, &self.shared.output).map_err(|e| setup_error(&e))?;
        json::install(&lua).map_err(|e| setup_error(&e))?;
        api::install_core(&lua).map_err(|e| setup_error(&e))?;

        for extension in self.shared.extensions.lock().iter() {
            extension.install(&lua, &handle).map_err(|e| {
                warn!(extension = extension.name(), error = %e, "extension setup failed");
                ScriptError::from_lua(&e, extension.name())
            })?;
        }

        debug!(generation, "runtime built");
        Ok(Runtime {
            lua,
            pending: None,
            generation,
        })
    }

    /// Runs `f` with exclusive access to the runtime.
    ///
    /// This is the only path to runtime state. `f` must not call back into
    /// the engine.
    pub fn run_exclusive<R>(
        &self,
        f: impl FnOnce(&mut Runtime) -> Result<R, ScriptError>,
    ) -> Result<R, ScriptError> {
        let mut guard = self.shared.runtime.lock();
        let runtime = guard.as_mut().ok_or_else(|| self.unavailable())?;
        f(runtime)
    }

    /// Registers an extension, installing it into the current runtime.
    pub fn install(&self, extension: Arc<dyn RuntimeExtension>) -> Result<(), ScriptError> {
        let handle = self.handle();
        self.run_exclusive(|rt| {
            extension
                .install(&rt.lua, &handle)
                .map_err(|e| ScriptError::from_lua(&e, extension.name()))?;
            self.shared.extensions.lock().push(Arc::clone(&extension));
            debug!(extension = extension.name(), "extension installed");
            Ok(())
        })
    }

    /// Replaces the runtime with a fresh one.
    ///
    /// Every outstanding [`CallbackRef`](crate::CallbackRef) becomes invalid and
    /// every extension is notified and re-installed.
    pub fn reset(&self) -> Result<(), ScriptError> {
        let mut guard = self.shared.runtime.lock();
        if self.is_closed() {
            return Err(self.unavailable());
        }
        if let Some(runtime) = guard.take() {
            let extensions = self.shared.extensions.lock().clone();
            for extension in &extensions {
                extension.on_reset(&runtime);
            }
        }
        *guard = Some(self.build_runtime()?);
        info!("script engine reset");
        Ok(())
    }

    /// Releases the runtime. Every later call fails with `engine is closed`.
    pub fn close(&self) {
        let mut guard = self.shared.runtime.lock();
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = guard.take() {
            let extensions = self.shared.extensions.lock().clone();
            for extension in &extensions {
                extension.on_reset(&runtime);
            }
        }
        self.shared.output.close();
        info!("script engine closed");
    }

    /// Compiles `text` without running it.
    ///
    /// A syntax error is returned and also written to stderr output.
    #[tracing::instrument(skip(self, text), fields(len = text.len()))]
    pub fn load_script(&self, text: &str, name: &str) -> Result<(), ScriptError> {
        if text.is_empty() {
            return Err(ScriptError::api("empty script"));
        }
        self.run_exclusive(|rt| {
            match rt.lua.load(text).set_name(format!("={name}")).into_function() {
                Ok(func) => {
                    rt.pending = Some(PendingChunk {
                        func,
                        name: name.to_string(),
                    });
                    Ok(())
                }
                Err(e) => {
                    let err = ScriptError::from_lua(&e, name);
                    self.emit(OutputRecord::stderr(format!("{err}\n")));
                    Err(err)
                }
            }
        })
    }

    /// Reads `path` and loads it under its file name.
    pub fn load_script_file(&self, path: impl AsRef<Path>) -> Result<(), ScriptError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ScriptError::api(format!("cannot read script {}: {e}", path.display())).with_cause(e)
        })?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        self.load_script(&text, &name)
    }

    /// Runs a script to completion or until `ctx` is done.
    ///
    /// Non-empty `text` is loaded first; empty `text` runs the chunk loaded by
    /// [`load_script`](Self::load_script).
    #[tracing::instrument(skip(self, ctx, text), fields(len = text.len()))]
    pub fn execute_script(&self, ctx: &ExecContext, text: &str) -> Result<(), ScriptError> {
        self.execute(ctx, text, None)
    }

    /// Like [`execute_script`](Self::execute_script), exposing `args` to the
    /// chunk as `...` and as the global `arg` table (`arg[0]` is the chunk name).
    #[tracing::instrument(skip(self, ctx, text, args), fields(len = text.len(), args = args.len()))]
    pub fn execute_script_with_args(
        &self,
        ctx: &ExecContext,
        text: &str,
        args: &[String],
    ) -> Result<(), ScriptError> {
        self.execute(ctx, text, Some(args))
    }

    fn execute(
        &self,
        ctx: &ExecContext,
        text: &str,
        args: Option<&[String]>,
    ) -> Result<(), ScriptError> {
        ctx.check()?;
        if !text.is_empty() {
            self.load_script(text, DEFAULT_CHUNK_NAME)?;
        }
        self.drive(ctx, |rt| {
            let chunk = rt
                .pending
                .take()
                .ok_or_else(|| ScriptError::api("no script loaded"))?;
            let mut values = Vec::new();
            if let Some(args) = args {
                let lua = &rt.lua;
                let arg = lua.create_table().map_err(|e| setup_error(&e))?;
                arg.raw_set(0, chunk.name.as_str())
                    .map_err(|e| setup_error(&e))?;
                for (i, a) in args.iter().enumerate() {
                    let s = lua.create_string(a).map_err(|e| setup_error(&e))?;
                    arg.raw_set(i + 1, s.clone()).map_err(|e| setup_error(&e))?;
                    values.push(Value::String(s));
                }
                lua.globals()
                    .set("arg", arg)
                    .map_err(|e| setup_error(&e))?;
            }
            Ok((chunk.func, chunk.name, MultiValue::from_iter(values)))
        })
    }

    /// Calls global function `name` with no arguments.
    pub fn call_named(&self, name: &str) -> Result<(), ScriptError> {
        self.call_named_with(&ExecContext::background(), name)
    }

    /// Calls global function `name` under `ctx`.
    pub fn call_named_with(&self, ctx: &ExecContext, name: &str) -> Result<(), ScriptError> {
        ctx.check()?;
        self.drive(ctx, |rt| match rt.lua.globals().get::<Value>(name) {
            Ok(Value::Function(func)) => Ok((func, name.to_string(), MultiValue::new())),
            _ => Err(ScriptError::api(format!(
                "function {name} not found or not a function"
            ))),
        })
    }

    /// Runs a function in a driver coroutine until it finishes.
    fn drive<F>(&self, ctx: &ExecContext, prepare: F) -> Result<(), ScriptError>
    where
        F: FnOnce(&mut Runtime) -> Result<(Function, String, MultiValue), ScriptError>,
    {
        let watchdog = Watchdog {
            ctx: ctx.clone(),
            every: self.shared.config.watchdog_instructions.max(1),
        };
        let (thread, origin, generation, args) = self.run_exclusive(|rt| {
            let (func, origin, args) = prepare(rt)?;
            let thread = rt.lua.create_thread(func).map_err(|e| setup_error(&e))?;
            suspend::register_driver(&rt.lua, &thread).map_err(|e| setup_error(&e))?;
            Ok((thread, origin, rt.generation, args))
        })?;

        debug!(chunk = %origin, "script started");
        let mut next = Resume::Args(args);
        loop {
            let step = self.run_exclusive(|rt| {
                if rt.generation != generation {
                    return Err(ScriptError::runtime(
                        "runtime was reset while the script was suspended",
                    ));
                }
                let args = match std::mem::replace(&mut next, Resume::Empty) {
                    Resume::Args(args) => args,
                    Resume::Outcome(outcome) => {
                        outcome.into_resume(&rt.lua).map_err(|e| setup_error(&e))?
                    }
                    Resume::Empty => MultiValue::from_iter([Value::Boolean(true)]),
                };
                watchdog.watch(&rt.lua, &thread);
                let step = resume(rt, &thread, args, ctx, &origin);
                Watchdog::unwatch(&rt.lua);
                step
            })?;

            match step {
                Step::Finished => {
                    debug!(chunk = %origin, "script finished");
                    return Ok(());
                }
                Step::Sleep(duration) => {
                    ctx.sleep(duration, self.shared.config.sleep_slice())?;
                }
                Step::Host(job) => {
                    let outcome = crate::barrier::contain("device", || Ok(job()))
                        .unwrap_or_else(|e| HostOutcome::Raised(e.message));
                    ctx.check()?;
                    next = Resume::Outcome(outcome);
                }
            }
        }
    }

    // ─── Globals ────────────────────────────────────────────────────────

    /// Sets global `name` to a JSON value (`null` clears it).
    pub fn set_global(&self, name: &str, value: &serde_json::Value) -> Result<(), ScriptError> {
        self.run_exclusive(|rt| {
            let v = crate::types::json_to_lua(&rt.lua, value).map_err(|e| setup_error(&e))?;
            rt.lua
                .globals()
                .set(name, v)
                .map_err(|e| setup_error(&e))
        })
    }

    /// Reads global `name` as JSON.
    pub fn global(&self, name: &str) -> Result<serde_json::Value, ScriptError> {
        self.run_exclusive(|rt| {
            let v: Value = rt.lua.globals().get(name).map_err(|e| setup_error(&e))?;
            crate::types::lua_to_json(&v)
                .map_err(|e| ScriptError::api(format!("global {name}: {e}")))
        })
    }

    /// Reads global `name` as an integer, if it is one.
    pub fn global_integer(&self, name: &str) -> Result<Option<i64>, ScriptError> {
        self.run_exclusive(|rt| {
            let v: Value = rt.lua.globals().get(name).map_err(|e| setup_error(&e))?;
            Ok(match v {
                Value::Integer(i) => Some(i),
                Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(n as i64),
                _ => None,
            })
        })
    }

    /// Reads global `name` as a string, if it is one.
    pub fn global_string(&self, name: &str) -> Result<Option<String>, ScriptError> {
        self.run_exclusive(|rt| {
            let v: Value = rt.lua.globals().get(name).map_err(|e| setup_error(&e))?;
            Ok(match v {
                Value::String(s) => Some(s.to_string_lossy()),
                _ => None,
            })
        })
    }

    /// Reads `table[key]` of global table `table` as JSON.
    pub fn table_value(&self, table: &str, key: &str) -> Result<serde_json::Value, ScriptError> {
        self.run_exclusive(|rt| match rt.lua.globals().get::<Value>(table) {
            Ok(Value::Table(t)) => {
                let v: Value = t.get(key).map_err(|e| setup_error(&e))?;
                crate::types::lua_to_json(&v)
                    .map_err(|e| ScriptError::api(format!("{table}.{key}: {e}")))
            }
            _ => Err(ScriptError::api(format!("global {table} is not a table"))),
        })
    }
}

/// Interrupts the running coroutine of a driven script once its context is done.
///
/// Present as app data only while the driver coroutine is being resumed, so
/// subscription callbacks running between steps are never interrupted.
#[derive(Clone)]
struct Watchdog {
    ctx: ExecContext,
    every: u32,
}

impl Watchdog {
    fn watch(&self, lua: &Lua, driver: &Thread) {
        lua.set_app_data(self.clone());
        self.arm(driver);
    }

    fn unwatch(lua: &Lua) {
        lua.remove_app_data::<Watchdog>();
        lua.remove_hook();
    }

    /// Moves the hook to `thread`. Only one thread carries it at a time.
    fn arm(&self, thread: &Thread) {
        let ctx = self.ctx.clone();
        thread.set_hook(
            HookTriggers::new().every_nth_instruction(self.every),
            move |_lua, _debug| {
                if let Some(reason) = ctx.interruption() {
                    return Err(mlua::Error::external(reason));
                }
                Ok(VmState::Continue)
            },
        );
    }
}

/// Replaces `coroutine.resume` and `coroutine.wrap` so the watchdog follows
/// the script into coroutines it creates.
fn guard_coroutines(lua: &Lua) -> mlua::Result<()> {
    let coroutine: Table = lua.globals().get("coroutine")?;
    lua.set_named_registry_value(RESUME_KEY, coroutine.get::<Function>("resume")?)?;

    let resume = lua.create_function(|lua, (co, args): (Value, MultiValue)| {
        let inner: Function = lua.named_registry_value(RESUME_KEY)?;
        let watchdog = lua.app_data_ref::<Watchdog>().map(|w| w.clone());
        let Some(watchdog) = watchdog else {
            return inner.call::<MultiValue>((co, args));
        };
        if let Value::Thread(thread) = &co {
            watchdog.arm(thread);
        }
        let result = inner.call::<MultiValue>((co, args));
        watchdog.arm(&lua.current_thread());
        result
    })?;

    let table: Table = lua.globals().get("table")?;
    let wrap = lua
        .load(COROUTINE_WRAP)
        .set_name("=blim.coroutine")
        .call::<Function>((
            coroutine.get::<Function>("create")?,
            resume.clone(),
            lua.globals().get::<Function>("error")?,
            table.get::<Function>("pack")?,
            table.get::<Function>("unpack")?,
        ))?;

    coroutine.set("resume", resume)?;
    coroutine.set("wrap", wrap)
}

fn resume(
    rt: &Runtime,
    thread: &Thread,
    args: MultiValue,
    ctx: &ExecContext,
    origin: &str,
) -> Result<Step, ScriptError> {
    match thread.resume::<MultiValue>(args) {
        Ok(yielded) => {
            if thread.status() != ThreadStatus::Resumable {
                return Ok(Step::Finished);
            }
            match suspend::requested(&rt.lua, &yielded).map_err(|e| setup_error(&e))? {
                Some(Request::Sleep(duration)) => Ok(Step::Sleep(duration)),
                Some(Request::Host(job)) => Ok(Step::Host(job)),
                None => Err(ScriptError::runtime("attempt to yield from outside a coroutine")
                    .with_origin(origin)),
            }
        }
        Err(e) => match ctx.interruption() {
            Some(reason) => {
                info!(chunk = origin, reason = %reason, "script interrupted");
                Err(ScriptError::interrupted(reason))
            }
            None => Err(ScriptError::from_lua(&e, origin)),
        },
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("closed", &self.is_closed())
            .field("generation", &self.shared.generation.load(Ordering::Relaxed))
            .field("output", &self.shared.output)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use blim_runtime::output::OutputSource;
    use std::time::Instant;

    fn engine() -> ScriptEngine {
        ScriptEngine::with_defaults().unwrap()
    }

    fn drain(engine: &ScriptEngine) -> Vec<OutputRecord> {
        let pipe = engine.output();
        std::iter::from_fn(|| pipe.try_recv()).collect()
    }

    #[test]
    fn print_is_captured() {
        let e = engine();
        e.execute_script(&ExecContext::background(), r#"print("hello")"#)
            .unwrap();
        let records = drain(&e);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "hello\n");
        assert_eq!(records[0].source, OutputSource::Stdout);
    }

    #[test]
    fn syntax_error_goes_to_stderr() {
        let e = engine();
        let err = e.load_script("if true then", "broken").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
        assert_eq!(err.origin.as_deref(), Some("broken"));
        let records = drain(&e);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, OutputSource::Stderr);
        assert!(records[0].content.contains(&err.message));
    }

    #[test]
    fn runtime_error_has_line() {
        let e = engine();
        let err = e
            .execute_script(&ExecContext::background(), "local x = 1\nerror('boom')")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Runtime);
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn empty_and_missing_scripts() {
        let e = engine();
        assert_eq!(e.load_script("", "x").unwrap_err().message, "empty script");
        let err = e.execute_script(&ExecContext::background(), "").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
        assert_eq!(err.message, "no script loaded");
    }

    #[test]
    fn load_then_execute_pending_chunk() {
        let e = engine();
        e.load_script("answer = 42", "setup").unwrap();
        assert_eq!(e.global_integer("answer").unwrap(), None);
        e.execute_script(&ExecContext::background(), "").unwrap();
        assert_eq!(e.global_integer("answer").unwrap(), Some(42));
    }

    #[test]
    fn call_named_function() {
        let e = engine();
        e.execute_script(
            &ExecContext::background(),
            "count = 0\nfunction bump() count = count + 1 end",
        )
        .unwrap();
        e.call_named("bump").unwrap();
        e.call_named("bump").unwrap();
        assert_eq!(e.global_integer("count").unwrap(), Some(2));

        let err = e.call_named("missing").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
        assert_eq!(err.message, "function missing not found or not a function");
    }

    #[test]
    fn blocked_capability_is_api_error() {
        let e = engine();
        let err = e
            .execute_script(&ExecContext::background(), "os.execute('true')")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
        assert!(err.message.contains("is blocked"));
    }

    #[test]
    fn cancellation_interrupts_busy_loop() {
        let e = engine();
        let ctx = ExecContext::with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = e
            .execute_script(&ctx, "while true do end")
            .unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));

        // Engine stays usable.
        e.execute_script(&ExecContext::background(), "x = 1").unwrap();
    }

    #[test]
    fn cancellation_reaches_nested_coroutines() {
        let e = engine();
        for code in [
            "coroutine.wrap(function() while true do end end)()",
            "local co = coroutine.create(function() while true do end end)\n\
             while true do coroutine.resume(co) end",
            "coroutine.wrap(function()\n\
               coroutine.wrap(function() while true do end end)()\n\
             end)()",
        ] {
            let ctx = ExecContext::with_timeout(Duration::from_millis(50));
            let started = Instant::now();
            let err = e.execute_script(&ctx, code).unwrap_err();
            assert!(err.is_cancelled(), "{code}: {err}");
            assert!(started.elapsed() < Duration::from_secs(2), "{code}");
        }
        e.run_exclusive(|_| Ok(())).unwrap();
    }

    #[test]
    fn coroutines_behave_as_usual() {
        let e = engine();
        e.execute_script(
            &ExecContext::background(),
            r#"
            local gen = coroutine.wrap(function(a)
                local b = coroutine.yield(a + 1)
                return b * 2, "done"
            end)
            first = gen(1)
            second, tag = gen(5)

            local co = coroutine.create(function() error("inner", 0) end)
            ok, msg = coroutine.resume(co)
            wrapped_ok, wrapped_msg = pcall(coroutine.wrap(function() error("wrapped", 0) end))
            "#,
        )
        .unwrap();
        assert_eq!(e.global_integer("first").unwrap(), Some(2));
        assert_eq!(e.global_integer("second").unwrap(), Some(10));
        assert_eq!(e.global_string("tag").unwrap().as_deref(), Some("done"));
        assert_eq!(e.global("ok").unwrap(), serde_json::json!(false));
        assert_eq!(e.global_string("msg").unwrap().as_deref(), Some("inner"));
        assert_eq!(e.global("wrapped_ok").unwrap(), serde_json::json!(false));
        assert_eq!(e.global_string("wrapped_msg").unwrap().as_deref(), Some("wrapped"));
    }

    #[test]
    fn cancelled_context_fails_immediately() {
        let e = engine();
        let ctx = ExecContext::background();
        ctx.cancel();
        let err = e.execute_script(&ctx, "ran = true").unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(e.global("ran").unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn sleep_releases_lock() {
        let e = engine();
        let worker = e.clone();
        let started = Instant::now();
        let runner = std::thread::spawn(move || {
            worker.execute_script(&ExecContext::background(), "blim.sleep(200)")
        });
        std::thread::sleep(Duration::from_millis(50));
        e.run_exclusive(|_| Ok(())).unwrap();
        assert!(started.elapsed() < Duration::from_millis(190));
        runner.join().unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn sleep_is_cancellable() {
        let e = engine();
        let ctx = ExecContext::with_timeout(Duration::from_millis(30));
        let started = Instant::now();
        let err = e.execute_script(&ctx, "blim.sleep(5000)").unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn reset_clears_state() {
        let e = engine();
        e.execute_script(&ExecContext::background(), "leftover = 'x'")
            .unwrap();
        e.reset().unwrap();
        assert_eq!(e.global_string("leftover").unwrap(), None);
    }

    #[test]
    fn closed_engine_fails_cleanly() {
        let e = engine();
        e.close();
        let err = e
            .execute_script(&ExecContext::background(), "x = 1")
            .unwrap_err();
        assert_eq!(err.message, "engine is closed");
        assert!(e.reset().is_err());
        assert!(e.output().is_closed());
        e.close();
    }

    #[test]
    fn globals_roundtrip() {
        let e = engine();
        e.set_global("cfg", &serde_json::json!({ "rate": 10, "name": "hr" }))
            .unwrap();
        assert_eq!(e.table_value("cfg", "rate").unwrap(), serde_json::json!(10));
        e.execute_script(&ExecContext::background(), "label = cfg.name .. '!'")
            .unwrap();
        assert_eq!(e.global_string("label").unwrap().as_deref(), Some("hr!"));
        assert!(e.table_value("label", "x").is_err());
    }

    #[test]
    fn cyclic_global_is_an_error() {
        let e = engine();
        e.execute_script(&ExecContext::background(), "loop = {}; loop.self = loop")
            .unwrap();
        let err = e.global("loop").unwrap_err();
        assert!(err.message.contains("recursive table"), "{err}");
        let err = e.table_value("loop", "self").unwrap_err();
        assert!(err.message.contains("recursive table"), "{err}");
    }

    #[test]
    fn script_args_are_visible() {
        let e = engine();
        e.execute_script_with_args(
            &ExecContext::background(),
            "first, count, name = arg[1], select('#', ...), arg[0]",
            &["alpha".to_string(), "beta".to_string()],
        )
        .unwrap();
        assert_eq!(e.global_string("first").unwrap().as_deref(), Some("alpha"));
        assert_eq!(e.global_integer("count").unwrap(), Some(2));
        assert_eq!(
            e.global_string("name").unwrap().as_deref(),
            Some(DEFAULT_CHUNK_NAME)
        );
    }

    #[test]
    fn load_script_file_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.lua");
        std::fs::write(&path, "error('from file')").unwrap();

        let e = engine();
        e.load_script_file(&path).unwrap();
        let err = e.execute_script(&ExecContext::background(), "").unwrap_err();
        assert_eq!(err.origin.as_deref(), Some("hello.lua"));

        let err = e.load_script_file(dir.path().join("missing.lua")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
    }
}

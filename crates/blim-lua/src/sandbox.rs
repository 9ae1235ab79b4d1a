//! Standard library hardening and output capture.
//!
//! Output functions are redirected into the engine's [`OutputPipe`]; nothing
//! a script prints ever reaches the process's real streams. Functions that
//! touch the filesystem, spawn processes or exit the process are replaced by
//! stubs failing with `"<name> is blocked"`.

use crate::barrier::guard_host_fn;
use crate::error::ScriptError;
use blim_runtime::output::{OutputPipe, OutputRecord, OutputSource};
use mlua::{Function, Lua, MultiValue, Table, Value};
use std::sync::Arc;

const BLOCKED_OS: &[&str] = &["execute", "exit", "remove", "rename", "tmpname", "getenv"];

const BLOCKED_IO: &[&str] = &[
    "open", "popen", "lines", "read", "close", "input", "output", "tmpfile",
];

const BLOCKED_GLOBALS: &[&str] = &["dofile", "loadfile"];

/// Modules `require` may resolve.
pub const PRELOADED_MODULES: &[&str] = &["json", "blim"];

/// Installs every sandbox replacement into `lua`.
pub fn install(lua: &Lua, output: &Arc<OutputPipe>) -> mlua::Result<()> {
    install_print(lua, output)?;
    install_io(lua, output)?;
    install_blocked(lua)?;
    install_require(lua)
}

/// Renders values with the runtime's own `tostring`.
fn render(lua: &Lua, args: MultiValue) -> mlua::Result<Vec<String>> {
    let tostring: Function = lua.globals().get("tostring")?;
    args.into_iter()
        .map(|v| tostring.call::<String>(v))
        .collect()
}

fn install_print(lua: &Lua, output: &Arc<OutputPipe>) -> mlua::Result<()> {
    let pipe = Arc::clone(output);
    let print = guard_host_fn(lua, "print", move |lua, args: MultiValue| {
        let mut line = render(lua, args)?.join("\t");
        line.push('\n');
        pipe.send(OutputRecord::stdout(line));
        Ok(())
    })?;
    lua.globals().set("print", print)
}

/// `io.write`, `io.stdout:write` and `io.stderr:write`.
fn install_io(lua: &Lua, output: &Arc<OutputPipe>) -> mlua::Result<()> {
    let io: Table = lua.globals().get("io")?;

    let stdout = capture_file(lua, output, OutputSource::Stdout)?;
    let stderr = capture_file(lua, output, OutputSource::Stderr)?;

    let stdout_write: Function = stdout.get("write")?;
    io.set("write", stdout_write)?;
    io.set("stdout", stdout)?;
    io.set("stderr", stderr)?;
    Ok(())
}

fn capture_file(lua: &Lua, output: &Arc<OutputPipe>, source: OutputSource) -> mlua::Result<Table> {
    let file = lua.create_table()?;
    let pipe = Arc::clone(output);
    // The file table is looked up again on each call; capturing it would pin it.
    let write = guard_host_fn(
        lua,
        format!("io.{source}:write"),
        move |lua, args: MultiValue| {
            let io: Table = lua.globals().get("io")?;
            let this: Table = io.get(source.as_str())?;

            let mut args = args.into_iter().peekable();
            if let Some(Value::Table(first)) = args.peek() {
                if first.to_pointer() == this.to_pointer() {
                    args.next();
                }
            }

            let mut text = String::new();
            for value in args {
                match &value {
                    Value::String(s) => text.push_str(&s.to_string_lossy()),
                    Value::Integer(_) | Value::Number(_) => {
                        text.push_str(&render(lua, MultiValue::from_iter([value]))?.concat());
                    }
                    other => {
                        return Err(ScriptError::api(format!(
                            "bad argument to 'write' (string expected, got {})",
                            other.type_name()
                        ))
                        .into())
                    }
                }
            }
            if !text.is_empty() {
                pipe.send(OutputRecord::new(source, text));
            }
            Ok(this)
        },
    )?;
    file.set("write", write)?;
    Ok(file)
}

fn blocked_stub(lua: &Lua, qualified: String) -> mlua::Result<Function> {
    let name = qualified.clone();
    guard_host_fn(lua, qualified, move |_, _: MultiValue| -> mlua::Result<()> {
        tracing::debug!(function = %name, "blocked function called");
        Err(ScriptError::api(format!("{name} is blocked")).into())
    })
}

fn install_blocked(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    let os: Table = globals.get("os")?;
    for name in BLOCKED_OS {
        os.set(*name, blocked_stub(lua, format!("os.{name}"))?)?;
    }

    let io: Table = globals.get("io")?;
    for name in BLOCKED_IO {
        io.set(*name, blocked_stub(lua, format!("io.{name}"))?)?;
    }

    for name in BLOCKED_GLOBALS {
        globals.set(*name, blocked_stub(lua, (*name).to_string())?)?;
    }
    Ok(())
}

/// `require` limited to modules already present in `package.loaded`.
fn install_require(lua: &Lua) -> mlua::Result<()> {
    let package: Table = lua.globals().get("package")?;
    package.set("path", "")?;
    package.set("cpath", "")?;
    package.set("searchers", lua.create_table()?)?;

    let require = guard_host_fn(lua, "require", |lua, name: String| {
        if PRELOADED_MODULES.contains(&name.as_str()) {
            let loaded: Table = lua.globals().get::<Table>("package")?.get("loaded")?;
            let module: Value = loaded.get(name.as_str())?;
            if !module.is_nil() {
                return Ok(module);
            }
        }
        Err(ScriptError::api(format!("module '{name}' not found")).into())
    })?;
    lua.globals().set("require", require)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandboxed() -> (Lua, Arc<OutputPipe>) {
        let lua = Lua::new();
        let pipe = Arc::new(OutputPipe::new(16));
        install(&lua, &pipe).unwrap();
        (lua, pipe)
    }

    fn drain(pipe: &OutputPipe) -> Vec<OutputRecord> {
        std::iter::from_fn(|| pipe.try_recv()).collect()
    }

    #[test]
    fn print_joins_with_tabs() {
        let (lua, pipe) = sandboxed();
        lua.load(r#"print("a", 1, nil, true)"#).exec().unwrap();
        let records = drain(&pipe);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "a\t1\tnil\ttrue\n");
        assert_eq!(records[0].source, OutputSource::Stdout);
    }

    #[test]
    fn print_uses_tostring_metamethod() {
        let (lua, pipe) = sandboxed();
        lua.load(
            r#"
            local t = setmetatable({}, { __tostring = function() return "custom" end })
            print(t)
            "#,
        )
        .exec()
        .unwrap();
        assert_eq!(drain(&pipe)[0].content, "custom\n");
    }

    #[test]
    fn io_write_variants_capture() {
        let (lua, pipe) = sandboxed();
        lua.load(
            r#"
            io.write("a", 1)
            io.stdout:write("b"):write("c")
            io.stderr:write("oops\n")
            "#,
        )
        .exec()
        .unwrap();
        let records = drain(&pipe);
        let stdout: String = records
            .iter()
            .filter(|r| r.source == OutputSource::Stdout)
            .map(|r| r.content.as_str())
            .collect();
        assert_eq!(stdout, "a1bc");
        let stderr: Vec<_> = records
            .iter()
            .filter(|r| r.source == OutputSource::Stderr)
            .collect();
        assert_eq!(stderr.len(), 1);
        assert_eq!(stderr[0].content, "oops\n");
    }

    #[test]
    fn blocked_functions_fail() {
        let (lua, _pipe) = sandboxed();
        for call in ["os.execute('ls')", "os.exit(1)", "io.open('/etc/passwd')", "dofile('x')"] {
            let err = lua.load(call).exec().unwrap_err();
            assert!(err.to_string().contains("is blocked"), "{call}: {err}");
        }
        // Harmless parts of os remain.
        let t: i64 = lua.load("return os.time()").eval().unwrap();
        assert!(t > 0);
    }

    #[test]
    fn require_only_resolves_preloaded() {
        let (lua, _pipe) = sandboxed();
        let err = lua.load("require('socket')").exec().unwrap_err();
        assert!(err.to_string().contains("module 'socket' not found"), "{err}");

        crate::json::install(&lua).unwrap();
        let ok: bool = lua
            .load("return require('json') == json")
            .eval()
            .unwrap();
        assert!(ok);
    }
}

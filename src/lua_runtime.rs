//! Sandboxed Lua 5.4 VM setup for user hooks.
//!
//! Every script hook invocation gets a fresh VM configured here. Scripts
//! run on a blocking thread, so host functions use synchronous I/O.
//!
//! | Global | Functions |
//! |--------|-----------|
//! | `json` | `parse`, `encode` |
//! | `env` | `get` |
//! | `log` | `debug`, `info`, `warn`, `error` |
//! | `fs` | `read`, `exists` (inside the script's directory) |
//!
//! `os`, `io`, `debug`, `loadfile` and `dofile` are removed. A wall-clock
//! deadline is checked every 10 000 VM instructions.

use mlua::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A sandboxed VM with the host globals and the deadline installed.
pub(crate) fn new_vm(script_name: &str, sandbox_root: &Path, timeout_secs: u64) -> LuaResult<Lua> {
    let lua = Lua::new();

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(mlua::Error::RuntimeError(format!(
                    "script timed out after {timeout_secs} seconds"
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );

    let globals = lua.globals();
    for name in ["os", "io", "loadfile", "dofile", "debug"] {
        globals.set(name, LuaValue::Nil)?;
    }
    globals.set("json", json_api(&lua)?)?;
    globals.set("env", env_api(&lua)?)?;
    globals.set("log", log_api(&lua, script_name)?)?;
    globals.set("fs", fs_api(&lua, sandbox_root)?)?;
    Ok(lua)
}

/// JSON into Lua. `null` becomes `nil`; arrays keep mlua's array marker so
/// an empty list comes back as a list.
pub(crate) fn to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    lua.to_value_with(
        value,
        LuaSerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false),
    )
}

/// Lua into JSON. Functions and other host-only values are dropped.
pub(crate) fn from_lua(lua: &Lua, value: LuaValue) -> LuaResult<Value> {
    lua.from_value_with(value, LuaDeserializeOptions::new().deny_unsupported_types(false))
}

fn json_api(lua: &Lua) -> LuaResult<LuaTable> {
    let json = lua.create_table()?;
    json.set(
        "parse",
        lua.create_function(|lua, text: String| {
            let value: Value = serde_json::from_str(&text)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.parse: {}", e)))?;
            to_lua(lua, &value)
        })?,
    )?;
    json.set(
        "encode",
        lua.create_function(|lua, value: LuaValue| {
            serde_json::to_string(&from_lua(lua, value)?)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;
    Ok(json)
}

fn env_api(lua: &Lua) -> LuaResult<LuaTable> {
    let env = lua.create_table()?;
    env.set(
        "get",
        lua.create_function(|_lua, name: String| Ok(std::env::var(&name).ok()))?,
    )?;
    Ok(env)
}

fn log_api(lua: &Lua, script_name: &str) -> LuaResult<LuaTable> {
    let log = lua.create_table()?;
    for level in ["debug", "info", "warn", "error"] {
        let script = script_name.to_string();
        log.set(
            level,
            lua.create_function(move |_lua, msg: String| {
                match level {
                    "debug" => debug!(%script, "{msg}"),
                    "warn" => warn!(%script, "{msg}"),
                    "error" => error!(%script, "{msg}"),
                    _ => info!(%script, "{msg}"),
                }
                Ok(())
            })?,
        )?;
    }
    Ok(log)
}

/// Resolve `path` under `root`, refusing anything that escapes it.
fn confine(root: &Path, path: &str, op: &str) -> LuaResult<PathBuf> {
    let canonical = root
        .join(path)
        .canonicalize()
        .map_err(|e| mlua::Error::external(anyhow::anyhow!("{op}: {path}: {e}")))?;
    if !canonical.starts_with(root) {
        return Err(mlua::Error::external(anyhow::anyhow!(
            "{op}: path escapes sandbox: {path}"
        )));
    }
    Ok(canonical)
}

fn fs_api(lua: &Lua, sandbox_root: &Path) -> LuaResult<LuaTable> {
    let fs = lua.create_table()?;
    let root = sandbox_root
        .canonicalize()
        .unwrap_or_else(|_| sandbox_root.to_path_buf());

    let r = root.clone();
    fs.set(
        "read",
        lua.create_function(move |_lua, path: String| {
            let target = confine(&r, &path, "fs.read")?;
            std::fs::read_to_string(&target)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("fs.read: {}: {}", path, e)))
        })?,
    )?;
    fs.set(
        "exists",
        lua.create_function(move |_lua, path: String| Ok(confine(&root, &path, "fs.exists").is_ok()))?,
    )?;
    Ok(fs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn sandbox_removes_dangerous_globals() {
        let tmp = TempDir::new().unwrap();
        let lua = new_vm("t", tmp.path(), 5).unwrap();
        let kinds: String = lua
            .load("return type(os) .. type(io) .. type(dofile) .. type(json)")
            .eval()
            .unwrap();
        assert_eq!(kinds, "nilnilniltable");
    }

    #[test]
    fn fs_is_confined_to_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("in.txt"), "inside").unwrap();
        std::fs::write(tmp.path().join("out.txt"), "outside").unwrap();

        let lua = new_vm("t", &root, 5).unwrap();
        let inside: String = lua.load("return fs.read('in.txt')").eval().unwrap();
        assert_eq!(inside, "inside");
        assert!(lua.load("return fs.read('../out.txt')").eval::<String>().is_err());
        let exists: bool = lua.load("return fs.exists('../out.txt')").eval().unwrap();
        assert!(!exists);
    }

    #[test]
    fn runaway_script_times_out() {
        let tmp = TempDir::new().unwrap();
        let lua = new_vm("t", tmp.path(), 0).unwrap();
        let err = lua.load("while true do end").exec().unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn json_round_trip_through_lua() {
        let tmp = TempDir::new().unwrap();
        let lua = new_vm("t", tmp.path(), 5).unwrap();
        let value = json!({"a": [1, 2.5, "x"], "b": {"c": true}, "empty": []});
        let lv = to_lua(&lua, &value).unwrap();
        assert_eq!(from_lua(&lua, lv).unwrap(), value);

        let nil_for_null: bool = lua.load("return json.parse('{\"x\": null}').x == nil").eval().unwrap();
        assert!(nil_for_null);
        let encoded: String = lua
            .load("return json.encode({ n = 1, f = function() end })")
            .eval()
            .unwrap();
        assert_eq!(encoded, r#"{"n":1}"#);
    }
}

//! Lua-scripted user hooks.
//!
//! A script defines a global `hook` table:
//!
//! ```lua
//! hook = {
//!     name = "tag_agency",          -- required
//!     desc = "Stamp an agency tag",
//!     stage = "file",               -- pre | file | post (default file)
//!     category = "user",
//!     options = { agency = "NOAA" },
//! }
//!
//! function hook.run(items, opts)
//!     for _, item in ipairs(items) do
//!         item.entry.agency = opts.agency
//!     end
//!     return items
//! end
//! ```
//!
//! Each item is `{ connector = <name>, entry = {...} }`. Returning `nil`
//! leaves the items unchanged. Every call to [`ScriptHook::run`] loads the
//! script into a fresh VM (see [`crate::lua_runtime`]), so concurrent
//! file-stage invocations share nothing.

use anyhow::{bail, Context, Result};
use mlua::prelude::*;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::hooks::{Hook, HookArgs, HookInfo, HookOption, Stage};
use crate::lua_runtime::{from_lua, new_vm, to_lua};
use crate::models::{Entry, Item};
use crate::traits::Connector;

/// Load `path` and return the `hook` table it defines.
fn load_hook_table(lua: &Lua, path: &Path) -> Result<LuaTable> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read hook script: {}", path.display()))?;

    lua.load(&source)
        .set_name(path.to_string_lossy())
        .exec()
        .map_err(|e| anyhow::anyhow!("Failed to execute hook script {}: {}", path.display(), e))?;

    lua.globals()
        .get::<LuaTable>("hook")
        .map_err(|e| anyhow::anyhow!("Script must define a global 'hook' table: {}", e))
}

fn vm_for(path: &Path, name: &str, timeout_secs: u64) -> Result<Lua> {
    let dir = path.parent().unwrap_or(Path::new("."));
    new_vm(&format!("hook:{name}"), dir, timeout_secs)
        .map_err(|e| anyhow::anyhow!("Failed to initialise Lua VM: {}", e))
}

/// Read the descriptor of the script at `path`.
pub fn describe_script(path: &Path, timeout_secs: u64) -> Result<HookInfo> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let lua = vm_for(path, &stem, timeout_secs)?;
    let table = load_hook_table(&lua, path)?;

    let name: String = table
        .get::<Option<String>>("name")
        .map_err(|e| anyhow::anyhow!("hook.name must be a string: {}", e))?
        .filter(|n| !n.trim().is_empty())
        .with_context(|| format!("{}: hook.name is required", path.display()))?;

    table
        .get::<LuaFunction>("run")
        .map_err(|e| anyhow::anyhow!("hook.run function not defined: {}", e))?;

    let desc: Option<String> = table.get("desc").unwrap_or(None);
    let category: Option<String> = table.get("category").unwrap_or(None);
    let stage = match table.get::<Option<String>>("stage").unwrap_or(None) {
        Some(s) => s.parse::<Stage>()?,
        None => Stage::File,
    };

    let mut info = HookInfo::new(
        &name,
        desc.as_deref().unwrap_or(""),
        stage,
        category.as_deref().unwrap_or("user"),
    );

    if let Ok(options) = table.get::<LuaTable>("options") {
        let mut defaults: Vec<HookOption> = Vec::new();
        for pair in options.pairs::<String, LuaValue>() {
            let (key, value) =
                pair.map_err(|e| anyhow::anyhow!("hook.options keys must be strings: {}", e))?;
            let default = from_lua(&lua, value)
                .map_err(|e| anyhow::anyhow!("hook.options.{}: {}", key, e))?;
            defaults.push(HookOption::new(&key, default, ""));
        }
        defaults.sort_by(|a, b| a.name.cmp(&b.name));
        info.options = defaults;
    }

    Ok(info)
}

/// A hook backed by a Lua script.
pub struct ScriptHook {
    info: HookInfo,
    path: PathBuf,
    opts: Map<String, Value>,
    timeout_secs: u64,
}

impl ScriptHook {
    pub fn new(path: PathBuf, info: HookInfo, args: &HookArgs, timeout_secs: u64) -> Self {
        let mut opts: Map<String, Value> = info
            .options
            .iter()
            .map(|o| (o.name.clone(), o.default.clone()))
            .collect();
        for (k, v) in args.as_map() {
            opts.insert(k.clone(), v.clone());
        }
        Self {
            info,
            path,
            opts,
            timeout_secs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Hook for ScriptHook {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
        let lua = vm_for(&self.path, &self.info.name, self.timeout_secs)?;
        let table = load_hook_table(&lua, &self.path)?;
        let run: LuaFunction = table
            .get("run")
            .map_err(|e| anyhow::anyhow!("hook.run function not defined: {}", e))?;

        let payload = items
            .iter()
            .map(|i| {
                Ok(json!({
                    "connector": i.connector.name(),
                    "entry": serde_json::to_value(&i.entry)?,
                }))
            })
            .collect::<Result<Vec<Value>>>()?;

        let lua_items = to_lua(&lua, &Value::Array(payload))
            .map_err(|e| anyhow::anyhow!("Failed to convert items: {}", e))?;
        let lua_opts = to_lua(&lua, &Value::Object(self.opts.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to convert options: {}", e))?;

        let returned: LuaValue = run.call((lua_items, lua_opts)).map_err(|e| {
            anyhow::anyhow!("hook.run() failed in '{}': {}", self.path.display(), e)
        })?;
        if returned.is_nil() {
            return Ok(items);
        }

        let returned = from_lua(&lua, returned)
            .map_err(|e| anyhow::anyhow!("Failed to convert hook.run() result: {}", e))?;
        let records = match returned {
            Value::Array(records) => records,
            // An empty Lua table has no array part.
            Value::Object(map) if map.is_empty() => Vec::new(),
            other => bail!(
                "hook.run() in '{}' must return a list of items, got {}",
                self.path.display(),
                other
            ),
        };

        let connectors: Vec<Arc<dyn Connector>> =
            items.iter().map(|i| Arc::clone(&i.connector)).collect();
        Ok(records
            .into_iter()
            .enumerate()
            .filter_map(|(idx, record)| self.to_item(idx, record, &connectors))
            .collect())
    }
}

impl ScriptHook {
    /// Rebuild an [`Item`], resolving the connector by name among the
    /// input items.
    fn to_item(&self, idx: usize, record: Value, connectors: &[Arc<dyn Connector>]) -> Option<Item> {
        let Value::Object(mut record) = record else {
            warn!(hook = %self.info.name, index = idx + 1, "Returned item is not a table, skipped");
            return None;
        };

        let name = record
            .get("connector")
            .and_then(Value::as_str)
            .map(str::to_string);
        let entry_value = match record.remove("entry") {
            Some(v) => v,
            None => Value::Object(record),
        };
        let entry: Entry = match serde_json::from_value(entry_value) {
            Ok(e) => e,
            Err(e) => {
                warn!(hook = %self.info.name, index = idx + 1, error = %e, "Returned entry is malformed, skipped");
                return None;
            }
        };

        let connector = name
            .and_then(|n| connectors.iter().find(|c| c.name() == n))
            .or_else(|| connectors.first());
        match connector {
            Some(c) => Some(Item::new(Arc::clone(c), entry)),
            None => {
                warn!(hook = %self.info.name, index = idx + 1, "No connector to attach returned item to, skipped");
                None
            }
        }
    }
}

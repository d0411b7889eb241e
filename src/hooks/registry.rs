//! Name → factory catalog of hooks.
//!
//! Built-in hooks self-register from a static table
//! ([`HookRegistry::with_builtins`]). User hooks are Lua scripts found in
//! the configured hook directories ([`HookRegistry::load_user_hooks`]).
//! Registering a name twice replaces the earlier registration; the
//! replacement is logged at debug level.
//!
//! ```text
//! builtins  →  ~/.fetchez/hooks/*.lua  →  ./.fetchez/hooks/*.lua  →  [paths] hook_dirs
//!                                      (later wins)
//! ```

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{file_ops, metadata, pipeline_ops, Hook, HookArgs, HookInfo};
use crate::config::Config;
use crate::hook_script::{describe_script, ScriptHook};

/// Builds a hook instance from its descriptor and option values.
pub type HookFactory = Arc<dyn Fn(&HookInfo, &HookArgs) -> Result<Box<dyn Hook>> + Send + Sync>;

/// Where a registration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Builtin,
    Script(PathBuf),
    Custom,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Builtin => f.write_str("builtin"),
            Origin::Script(path) => write!(f, "script:{}", path.display()),
            Origin::Custom => f.write_str("custom"),
        }
    }
}

/// A registered hook type.
#[derive(Clone)]
pub struct Registration {
    pub info: HookInfo,
    pub origin: Origin,
    factory: HookFactory,
}

impl Registration {
    /// Instantiate with `args`.
    pub fn create(&self, args: &HookArgs) -> Result<Box<dyn Hook>> {
        (self.factory)(&self.info, args)
            .with_context(|| format!("Failed to configure hook '{}'", self.info.name))
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("info", &self.info)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Built-in hook types: a static descriptor plus a constructor.
pub(crate) trait Builtin: Hook + Sized + 'static {
    fn describe() -> HookInfo;
    fn build(info: HookInfo, args: &HookArgs) -> Result<Self>;
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: BTreeMap<String, Registration>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in hook.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        pipeline_ops::register(&mut registry);
        file_ops::register(&mut registry);
        metadata::register(&mut registry);
        registry
    }

    /// Built-ins plus user scripts from `config`'s hook directories.
    pub fn discover(config: &Config) -> Self {
        let mut registry = Self::with_builtins();
        let loaded = registry.load_user_hooks(&config.hook_dirs(), config.pipeline.script_timeout);
        if loaded > 0 {
            info!(count = loaded, "Loaded user hooks");
        }
        registry
    }

    /// Register `info` under its name, replacing any earlier registration.
    pub fn register<F>(&mut self, info: HookInfo, origin: Origin, factory: F)
    where
        F: Fn(&HookInfo, &HookArgs) -> Result<Box<dyn Hook>> + Send + Sync + 'static,
    {
        let name = info.name.clone();
        let registration = Registration {
            info,
            origin,
            factory: Arc::new(factory),
        };
        if let Some(previous) = self.hooks.insert(name.clone(), registration) {
            debug!(hook = %name, replaced = %previous.origin, "Hook re-registered");
        } else {
            debug!(hook = %name, "Registered hook");
        }
    }

    pub(crate) fn register_builtin<T: Builtin>(&mut self) {
        self.register(T::describe(), Origin::Builtin, |info, args| {
            let hook: Box<dyn Hook> = Box::new(T::build(info.clone(), args)?);
            Ok(hook)
        });
    }

    /// Load every `*.lua` (not starting with `_`) in `dirs` as a script
    /// hook. Scripts that fail to load are logged and skipped. Returns the
    /// number registered.
    pub fn load_user_hooks(&mut self, dirs: &[PathBuf], timeout_secs: u64) -> usize {
        let mut loaded = 0;
        for dir in dirs.iter().filter(|d| d.is_dir()) {
            for path in script_files(dir) {
                match describe_script(&path, timeout_secs) {
                    Ok(info) => {
                        let script = path.clone();
                        self.register(info, Origin::Script(path), move |info, args| {
                            let hook: Box<dyn Hook> = Box::new(ScriptHook::new(
                                script.clone(),
                                info.clone(),
                                args,
                                timeout_secs,
                            ));
                            Ok(hook)
                        });
                        loaded += 1;
                    }
                    Err(e) => {
                        warn!(script = %path.display(), error = %format!("{e:#}"), "Failed to load user hook")
                    }
                }
            }
        }
        loaded
    }

    /// Make the current registration of `target` also available as
    /// `alias`. Returns `false` when `target` is not registered.
    pub fn register_alias(&mut self, alias: &str, target: &str) -> bool {
        let Some(mut registration) = self.hooks.get(target).cloned() else {
            warn!(alias, target, "Alias target is not registered");
            return false;
        };
        registration.info.name = alias.to_string();
        self.hooks.insert(alias.to_string(), registration);
        debug!(alias, target, "Registered hook alias");
        true
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.hooks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    /// Instantiate `name` with `args`.
    pub fn create(&self, name: &str, args: &HookArgs) -> Result<Box<dyn Hook>> {
        self.get(name)
            .with_context(|| format!("Unknown hook '{name}'"))?
            .create(args)
    }

    /// Every registration, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.hooks.values()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

fn script_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            let name = p.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            name.ends_with(".lua") && !name.starts_with('_')
        })
        .collect();
    files.sort();
    files
}

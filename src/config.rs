//! Configuration loading.
//!
//! Configuration lives in `$FETCHEZ_HOME` (default `~/.fetchez`). Either a
//! TOML file (`config.toml`) or the JSON presets file (`presets.json`) is
//! accepted; the format is chosen by extension. Every section has
//! defaults, so a missing file is equivalent to [`Config::minimal`].
//!
//! ```toml
//! [paths]
//! data_dir = "/usr/share/fetchez/data"
//! hook_dirs = ["~/work/hooks"]
//!
//! [pipeline]
//! workers = 8
//! on_hook_error = "continue"
//!
//! [presets.archive-ready]
//! help = "Checksum, enrich and audit"
//! hooks = [
//!   { name = "checksum", args = { algo = "sha256" } },
//!   { name = "audit", args = { file = "${HOME}/archive.json" } },
//! ]
//!
//! [modules.multibeam.presets.inf_only]
//! help = "Fetch only .inf files"
//! hooks = [{ name = "filename_filter", args = { match = ".inf", stage = "pre" } }]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::pipeline::HookErrorPolicy;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Global presets declared by the user.
    #[serde(default)]
    pub presets: BTreeMap<String, PresetDef>,
    /// Per-connector settings, currently only scoped presets.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct PathsConfig {
    /// Bundled read-only index directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Extra directories scanned for user hooks.
    #[serde(default)]
    pub hook_dirs: Vec<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub on_hook_error: HookErrorPolicy,
    /// Seconds per script hook invocation.
    #[serde(default = "default_script_timeout")]
    pub script_timeout: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            on_hook_error: HookErrorPolicy::default(),
            script_timeout: default_script_timeout(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_script_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ModuleConfig {
    #[serde(default)]
    pub presets: BTreeMap<String, PresetDef>,
}

/// A named macro: a help string and an ordered list of hook invocations.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct PresetDef {
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub hooks: Vec<HookCall>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HookCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
}

impl HookCall {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: Map::new(),
        }
    }

    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }
}

impl Config {
    /// All defaults, no presets.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Directory holding user indices (`<config dir>/indices`).
    pub fn indices_dir(&self) -> PathBuf {
        config_dir().join("indices")
    }

    /// Bundled data directory: `[paths] data_dir`, then `$FETCHEZ_DATA_DIR`.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.paths
            .data_dir
            .as_deref()
            .map(expand_tilde)
            .or_else(|| std::env::var_os("FETCHEZ_DATA_DIR").map(PathBuf::from))
    }

    /// Hook directories in load order: user config dir, project-local
    /// `.fetchez/hooks`, then configured extras. Later directories win on
    /// name collisions.
    pub fn hook_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![
            config_dir().join("hooks"),
            PathBuf::from(".fetchez").join("hooks"),
        ];
        dirs.extend(self.paths.hook_dirs.iter().map(|p| expand_tilde(p)));
        dirs
    }
}

/// `$FETCHEZ_HOME`, or `~/.fetchez`.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("FETCHEZ_HOME") {
        return PathBuf::from(dir);
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fetchez")
}

/// `config.toml` if it exists, else `presets.json`.
pub fn default_config_path() -> PathBuf {
    let dir = config_dir();
    let toml_path = dir.join("config.toml");
    if toml_path.exists() {
        toml_path
    } else {
        dir.join("presets.json")
    }
}

/// Parse a config file, TOML or JSON by extension.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
        _ => toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
    };

    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }

    config.expand_env();
    Ok(config)
}

/// Load the user config, tolerating absence and malformed files.
///
/// A missing file yields [`Config::minimal`]. A file that fails to parse is
/// logged and also yields the minimal config, so a broken presets file
/// never prevents a run.
pub fn load_user_config(path: Option<&Path>) -> Config {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    if !path.exists() {
        return Config::minimal();
    }
    match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %format!("{e:#}"), "Could not load config file");
            Config::minimal()
        }
    }
}

impl Config {
    fn expand_env(&mut self) {
        let scoped = self.modules.values_mut().flat_map(|m| m.presets.values_mut());
        for preset in self.presets.values_mut().chain(scoped) {
            for call in &mut preset.hooks {
                for value in call.args.values_mut() {
                    if let Value::String(s) = value {
                        *s = expand_vars(s);
                    }
                }
            }
        }
    }
}

/// Replace `${VAR}` with the environment value (empty when unset).
pub fn expand_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                out.push_str(&std::env::var(var).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s == "~" || s.starts_with("~/") {
        if let Some(home) = home_dir() {
            return home.join(s.strip_prefix("~/").unwrap_or(""));
        }
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

//! Hook contract.
//!
//! A hook is a named processing step bound to one pipeline [`Stage`]:
//!
//! | Stage | Payload | Runs |
//! |-------|---------|------|
//! | `pre` | the whole queue before any transfer | once, single-threaded |
//! | `file` | a batch holding one finished transfer | once per transfer, from any worker |
//! | `post` | every item after all transfers | once, single-threaded |
//!
//! Every stage has the same signature, `Vec<Item> -> Vec<Item>`: a hook may
//! mutate, drop, reorder or expand items. Returning an empty queue from a
//! `pre` hook cancels the run.
//!
//! Hooks that produce derived files record them in
//! `entry.artifacts[<hook name>]` so later hooks (see `focus`) can pivot
//! onto them.
//!
//! Hooks are addressed on the command line as
//! `name[:key=value[,key=value...]]`, parsed by [`parse_hook_spec`].

pub mod file_ops;
pub mod metadata;
pub mod pipeline_ops;
pub mod registry;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

use crate::models::Item;

pub use registry::{HookRegistry, Origin};

/// Guards every hook write to standard output.
pub static OUTPUT_LOCK: Mutex<()> = Mutex::new(());

/// Write lines to stdout while holding [`OUTPUT_LOCK`].
pub(crate) fn emit<I, S>(lines: I)
where
    I: IntoIterator<Item = S>,
    S: fmt::Display,
{
    let _guard = OUTPUT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut out = std::io::stdout().lock();
    for line in lines {
        let _ = writeln!(out, "{line}");
    }
    let _ = out.flush();
}

// ═══════════════════════════════════════════════════════════════════════
// Descriptor types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pre,
    File,
    Post,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Pre, Stage::File, Stage::Post];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pre => "pre",
            Stage::File => "file",
            Stage::Post => "post",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pre" | "pre_fetch" => Ok(Stage::Pre),
            "file" => Ok(Stage::File),
            "post" | "post_fetch" => Ok(Stage::Post),
            other => bail!("unknown stage '{other}' (use pre, file or post)"),
        }
    }
}

/// One configurable parameter of a hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookOption {
    pub name: String,
    pub default: Value,
    pub help: String,
}

impl HookOption {
    pub fn new(name: &str, default: impl Into<Value>, help: &str) -> Self {
        Self {
            name: name.to_string(),
            default: default.into(),
            help: help.to_string(),
        }
    }
}

/// Identity and option schema of a hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookInfo {
    pub name: String,
    pub desc: String,
    pub stage: Stage,
    pub category: String,
    pub options: Vec<HookOption>,
}

impl HookInfo {
    pub fn new(name: &str, desc: &str, stage: Stage, category: &str) -> Self {
        Self {
            name: name.to_string(),
            desc: desc.to_string(),
            stage,
            category: category.to_string(),
            options: Vec::new(),
        }
    }

    pub fn option(mut self, name: &str, default: impl Into<Value>, help: &str) -> Self {
        self.options.push(HookOption::new(name, default, help));
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Hook trait
// ═══════════════════════════════════════════════════════════════════════

/// A hook instance: a descriptor bound to concrete option values.
///
/// `run` may be called concurrently from several workers when the hook
/// sits in the `file` stage, so implementations keep no unsynchronized
/// mutable state.
pub trait Hook: Send + Sync {
    fn info(&self) -> &HookInfo;

    /// Stage this instance runs in. Normally the descriptor's stage; a
    /// few hooks let callers override it with a `stage` option.
    fn stage(&self) -> Stage {
        self.info().stage
    }

    fn name(&self) -> &str {
        &self.info().name
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Arguments
// ═══════════════════════════════════════════════════════════════════════

/// Option values passed to a hook factory.
///
/// Values arriving from the command line are strings; the accessors
/// coerce them (`"true"`, `"1"`, `"yes"` for booleans, numeric strings
/// for numbers).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookArgs(Map<String, Value>);

impl HookArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Non-empty string form of a scalar value.
    pub fn str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn str_or(&self, key: &str, default: &str) -> String {
        self.str(key).unwrap_or_else(|| default.to_string())
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" | "" => false,
                _ => default,
            },
            _ => default,
        }
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| anyhow::anyhow!("option '{key}' is not a number")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("option '{key}' is not a number: {s:?}")),
            Some(other) => bail!("option '{key}' is not a number: {other}"),
        }
    }

    /// The `stage` option, falling back to `default`.
    pub fn stage_or(&self, default: Stage) -> Result<Stage> {
        match self.str("stage") {
            Some(s) => s.parse(),
            None => Ok(default),
        }
    }
}

impl From<Map<String, Value>> for HookArgs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Addressing
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Error, PartialEq)]
pub enum HookSpecError {
    #[error("hook spec is empty")]
    EmptyName,
    #[error("hook spec {spec:?}: segment {segment:?} has no key")]
    Dangling { spec: String, segment: String },
    #[error("hook spec {spec:?}: empty option name")]
    EmptyKey { spec: String },
}

/// Parse `name[:key=value[,key=value...]]`.
///
/// A segment without `=` continues the previous value, so commas survive
/// inside values such as command templates. Surrounding quotes are
/// stripped from values.
pub fn parse_hook_spec(spec: &str) -> std::result::Result<(String, HookArgs), HookSpecError> {
    let (name, rest) = match spec.split_once(':') {
        Some((name, rest)) => (name.trim(), Some(rest)),
        None => (spec.trim(), None),
    };
    if name.is_empty() {
        return Err(HookSpecError::EmptyName);
    }

    let mut pairs: Vec<(String, String)> = Vec::new();
    for segment in rest.into_iter().flat_map(|r| r.split(',')) {
        match segment.split_once('=') {
            Some((k, v)) => {
                let k = k.trim();
                if k.is_empty() {
                    return Err(HookSpecError::EmptyKey {
                        spec: spec.to_string(),
                    });
                }
                pairs.push((k.to_string(), v.to_string()));
            }
            None if segment.trim().is_empty() && pairs.is_empty() => {}
            None => match pairs.last_mut() {
                Some((_, v)) => {
                    v.push(',');
                    v.push_str(segment);
                }
                None => {
                    return Err(HookSpecError::Dangling {
                        spec: spec.to_string(),
                        segment: segment.to_string(),
                    })
                }
            },
        }
    }

    let mut args = HookArgs::new();
    for (k, v) in pairs {
        args.insert(&k, unquote(v.trim()));
    }
    Ok((name.to_string(), args))
}

fn unquote(s: &str) -> String {
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

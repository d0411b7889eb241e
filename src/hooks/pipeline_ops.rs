//! Pipeline-control hooks: `dryrun`, `focus` (also `focus_sink`), `pipe`.

use anyhow::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

use super::registry::{Builtin, HookRegistry};
use super::{emit, Hook, HookArgs, HookInfo, Stage};
use crate::ingest::absolute;
use crate::models::{Entry, Item};

pub(crate) fn register(registry: &mut HookRegistry) {
    registry.register_builtin::<DryRun>();
    registry.register_builtin::<Focus>();
    registry.register_alias("focus_sink", "focus");
    registry.register_builtin::<Pipe>();
}

// ═══════════════════════════════════════════════════════════════════════
// dryrun
// ═══════════════════════════════════════════════════════════════════════

/// Empties the queue so nothing is transferred.
pub struct DryRun {
    info: HookInfo,
}

impl Builtin for DryRun {
    fn describe() -> HookInfo {
        HookInfo::new(
            "dryrun",
            "Simulate the run: drop every entry before transfer",
            Stage::Pre,
            "pipeline",
        )
    }

    fn build(info: HookInfo, _args: &HookArgs) -> Result<Self> {
        Ok(Self { info })
    }
}

impl Hook for DryRun {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
        info!(queued = items.len(), "Dry run, nothing will be transferred");
        Ok(Vec::new())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// focus
// ═══════════════════════════════════════════════════════════════════════

/// Replaces the item list with one synthetic entry per artifact recorded
/// by the `target` hook.
///
/// ```text
/// [(m1, artifacts{T:[/a.tif]}), (m2, artifacts{})]
///                 │ focus:target=T
///                 ▼
/// [(m1, {url: file:///a.tif, dst_fn: /a.tif, status: 0, data_type: T_artifact})]
/// ```
pub struct Focus {
    info: HookInfo,
    target: Option<String>,
}

impl Builtin for Focus {
    fn describe() -> HookInfo {
        HookInfo::new(
            "focus",
            "Narrow the results down to the artifacts of one hook",
            Stage::Post,
            "pipeline",
        )
        .option("target", "", "Name of the hook whose artifacts to keep")
    }

    fn build(info: HookInfo, args: &HookArgs) -> Result<Self> {
        Ok(Self {
            info,
            target: args.str("target"),
        })
    }
}

impl Hook for Focus {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
        let Some(target) = self.target.as_deref() else {
            warn!(hook = %self.info.name, "No target given, results left unchanged");
            return Ok(items);
        };

        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut focused = Vec::new();
        for item in &items {
            for path in item.entry.artifacts.get(target) {
                let path = absolute(path);
                if !seen.insert(path.clone()) {
                    continue;
                }
                let entry = Entry {
                    url: format!("file://{}", path.display()),
                    dst_fn: Some(path),
                    status: Some(0),
                    data_type: Some(format!("{target}_artifact")),
                    artifacts: item.entry.artifacts.clone(),
                    ..Default::default()
                };
                focused.push(item.derive(entry));
            }
        }

        info!(target = %target, artifacts = focused.len(), "Focused on artifacts");
        Ok(focused)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// pipe
// ═══════════════════════════════════════════════════════════════════════

/// Prints the absolute path of every successful download.
pub struct Pipe {
    info: HookInfo,
}

impl Builtin for Pipe {
    fn describe() -> HookInfo {
        HookInfo::new(
            "pipe",
            "Print absolute paths of downloaded files to stdout",
            Stage::Post,
            "pipeline",
        )
    }

    fn build(info: HookInfo, _args: &HookArgs) -> Result<Self> {
        Ok(Self { info })
    }
}

impl Hook for Pipe {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
        emit(
            items
                .iter()
                .filter(|i| i.entry.is_success())
                .filter_map(|i| i.entry.dst_fn.as_deref())
                .map(|p| absolute(p).display().to_string()),
        );
        Ok(items)
    }
}
